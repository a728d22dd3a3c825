use crate::error::Result;
use crate::name::TunnelName;
use crate::process::{CommandPattern, ProcessHost, ProcessId, command_name_matches};
use crate::registry::ProcessRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which probe tier found the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSource {
    /// The registry record pointed at a live process of the right binary
    Registry,
    /// Found by scanning command lines
    Scan,
}

/// Outcome of probing a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running { pid: ProcessId, source: ProbeSource },
    Stopped,
}

impl Liveness {
    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running { .. })
    }

    pub fn pid(&self) -> Option<ProcessId> {
        match self {
            Liveness::Running { pid, .. } => Some(*pid),
            Liveness::Stopped => None,
        }
    }
}

/// Decides whether a tunnel's process is alive and is still the tunnel tool.
///
/// Probing is a self-healing read: a record that points at a dead or
/// recycled PID is deleted on the way through.
pub struct LivenessProber<H: ProcessHost> {
    host: Arc<H>,
    registry: ProcessRegistry,
    tool: String,
}

impl<H: ProcessHost> LivenessProber<H> {
    /// `tool` is the binary name the process must report
    pub fn new(host: Arc<H>, registry: ProcessRegistry, tool: impl Into<String>) -> Self {
        Self {
            host,
            registry,
            tool: tool.into(),
        }
    }

    pub async fn probe(&self, name: &TunnelName) -> Result<Liveness> {
        if let Some(record) = self.registry.read_record(name).await? {
            if self.is_tool_process(record.pid).await {
                debug!("Tunnel '{}' running per registry (PID: {})", name, record.pid);
                return Ok(Liveness::Running {
                    pid: record.pid,
                    source: ProbeSource::Registry,
                });
            }

            info!(
                "Removing stale registry record for tunnel '{}' (PID: {})",
                name, record.pid
            );
            self.registry.clear_record(name).await?;
        }

        let pattern = CommandPattern::tunnel_run(&self.tool, name.as_str());
        let matches = self.host.find_by_command_line(&pattern).await;
        match matches.as_slice() {
            [] => {
                debug!("Tunnel '{}' is not running", name);
                Ok(Liveness::Stopped)
            }
            [pid, rest @ ..] => {
                if !rest.is_empty() {
                    warn!(
                        "Multiple processes match tunnel '{}' ({}), using PID {}: {:?}",
                        name, pattern, pid, matches
                    );
                } else {
                    info!("Found unrecorded process for tunnel '{}' (PID: {})", name, pid);
                }
                Ok(Liveness::Running {
                    pid: *pid,
                    source: ProbeSource::Scan,
                })
            }
        }
    }

    /// Signal-0 existence plus a binary name check against PID reuse
    async fn is_tool_process(&self, pid: ProcessId) -> bool {
        if !self.host.is_alive(pid).await {
            debug!("Recorded PID {} no longer exists", pid);
            return false;
        }
        match self.host.command_name(pid).await {
            Some(command) if command_name_matches(&command, &self.tool) => true,
            Some(command) => {
                warn!(
                    "Recorded PID {} now belongs to '{}', not '{}'",
                    pid, command, self.tool
                );
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    fn name(s: &str) -> TunnelName {
        TunnelName::new(s).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Arc<FakeHost>, ProcessRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path(), "cloudflared");
        (dir, Arc::new(FakeHost::default()), registry)
    }

    #[tokio::test]
    async fn test_recorded_live_process_is_running() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        host.add_process(ProcessId(10), "cloudflared", "cloudflared tunnel run demo");
        registry.record_start(&demo, ProcessId(10)).await.unwrap();

        let prober = LivenessProber::new(host, registry.clone(), "cloudflared");
        assert_eq!(
            prober.probe(&demo).await.unwrap(),
            Liveness::Running {
                pid: ProcessId(10),
                source: ProbeSource::Registry
            }
        );
        assert!(registry.record_path(&demo).exists());
    }

    #[tokio::test]
    async fn test_dead_pid_record_is_reclaimed() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        registry.record_start(&demo, ProcessId(10)).await.unwrap();

        let prober = LivenessProber::new(host, registry.clone(), "cloudflared");
        assert_eq!(prober.probe(&demo).await.unwrap(), Liveness::Stopped);
        assert!(!registry.record_path(&demo).exists());
    }

    #[tokio::test]
    async fn test_recycled_pid_is_not_trusted() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        host.add_process(ProcessId(10), "bash", "bash");
        registry.record_start(&demo, ProcessId(10)).await.unwrap();

        let prober = LivenessProber::new(host.clone(), registry.clone(), "cloudflared");
        assert_eq!(prober.probe(&demo).await.unwrap(), Liveness::Stopped);
        assert!(!registry.record_path(&demo).exists());
        // the unrelated process was left alone
        assert!(host.signals().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_falls_back_to_scan() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        std::fs::write(registry.record_path(&demo), "garbage").unwrap();

        let prober = LivenessProber::new(host, registry.clone(), "cloudflared");
        assert_eq!(prober.probe(&demo).await.unwrap(), Liveness::Stopped);
        assert!(!registry.record_path(&demo).exists());
    }

    #[tokio::test]
    async fn test_scan_finds_unrecorded_process() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        host.add_process(
            ProcessId(33),
            "cloudflared",
            "cloudflared tunnel --config /x/demo.yml run demo",
        );
        host.add_process(ProcessId(34), "cloudflared", "cloudflared tunnel run other");

        let prober = LivenessProber::new(host, registry, "cloudflared");
        let liveness = prober.probe(&demo).await.unwrap();
        assert_eq!(
            liveness,
            Liveness::Running {
                pid: ProcessId(33),
                source: ProbeSource::Scan
            }
        );
        assert_eq!(liveness.pid(), Some(ProcessId(33)));
    }

    #[tokio::test]
    async fn test_scan_with_several_matches_uses_lowest_pid() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        host.add_process(ProcessId(90), "cloudflared", "cloudflared tunnel run demo");
        host.add_process(ProcessId(12), "cloudflared", "cloudflared tunnel run demo");

        let prober = LivenessProber::new(host, registry, "cloudflared");
        assert_eq!(prober.probe(&demo).await.unwrap().pid(), Some(ProcessId(12)));
    }

    #[tokio::test]
    async fn test_scan_ignores_tunnels_sharing_a_name_prefix() {
        let (_dir, host, registry) = setup();
        host.add_process(
            ProcessId(40),
            "cloudflared",
            "cloudflared tunnel run web-staging",
        );

        let prober = LivenessProber::new(host, registry, "cloudflared");
        assert_eq!(prober.probe(&name("web")).await.unwrap(), Liveness::Stopped);
        assert_eq!(
            prober.probe(&name("web-staging")).await.unwrap().pid(),
            Some(ProcessId(40))
        );
    }

    #[tokio::test]
    async fn test_status_reflects_out_of_band_kill() {
        let (_dir, host, registry) = setup();
        let demo = name("demo");
        host.add_process(ProcessId(10), "cloudflared", "cloudflared tunnel run demo");
        registry.record_start(&demo, ProcessId(10)).await.unwrap();

        let prober = LivenessProber::new(host.clone(), registry.clone(), "cloudflared");
        assert!(prober.probe(&demo).await.unwrap().is_running());

        host.remove_process(ProcessId(10));
        assert!(!prober.probe(&demo).await.unwrap().is_running());
        assert!(!registry.record_path(&demo).exists());
    }
}
