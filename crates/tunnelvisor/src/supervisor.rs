use crate::factory::{PlatformHost, PlatformProcessHostFactory};
use crate::lock::TunnelLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnelvisor_core::{
    Liveness, LivenessProber, LogSink, ProcessHost, ProcessHostFactory, ProcessId,
    ProcessRegistry, Result, SpawnSpec, StopOutcome, StopPolicy, StopSequence, SupervisorConfig,
    SupervisorError, TerminationResult, TunnelName,
};

/// Lifecycle state of one tunnel, as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
        };
        f.write_str(state)
    }
}

impl From<&Liveness> for TunnelState {
    fn from(liveness: &Liveness) -> Self {
        if liveness.is_running() {
            TunnelState::Running
        } else {
            TunnelState::Stopped
        }
    }
}

/// What a successful stop did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub name: TunnelName,
    pub pid: ProcessId,
    pub outcome: StopOutcome,
}

/// Starts, stops and reports on named tunnel processes.
///
/// Every mutating operation holds the tunnel's advisory lock and re-probes
/// the OS before acting, so the registry never drives a decision on its own.
pub struct TunnelSupervisor<H: ProcessHost = PlatformHost> {
    config: SupervisorConfig,
    host: Arc<H>,
    registry: ProcessRegistry,
    logs: LogSink,
    prober: LivenessProber<H>,
}

impl TunnelSupervisor<PlatformHost> {
    /// Supervisor backed by the current platform's process host
    pub async fn new(config: SupervisorConfig) -> Result<Self> {
        let host = PlatformProcessHostFactory::create_process_host();
        Self::with_host(config, Arc::new(host)).await
    }
}

impl<H: ProcessHost> TunnelSupervisor<H> {
    pub async fn with_host(config: SupervisorConfig, host: Arc<H>) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .map_err(|e| SupervisorError::storage(&config.state_dir, e))?;

        let registry = ProcessRegistry::new(&config.state_dir, &config.file_prefix);
        let logs = LogSink::new(&config.state_dir, &config.file_prefix);
        let prober = LivenessProber::new(host.clone(), registry.clone(), config.binary_name());

        info!(
            "Created TunnelSupervisor with platform: {} (state: {})",
            host.platform_name(),
            config.state_dir.display()
        );

        Ok(Self {
            config,
            host,
            registry,
            logs,
            prober,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn log_path(&self, name: &TunnelName) -> PathBuf {
        self.logs.log_path(name)
    }

    pub fn record_path(&self, name: &TunnelName) -> PathBuf {
        self.registry.record_path(name)
    }

    fn lock_path(&self, name: &TunnelName) -> PathBuf {
        self.config
            .state_dir
            .join(format!("{}-{}.lock", self.config.file_prefix, name))
    }

    async fn lock(&self, name: &TunnelName) -> Result<TunnelLock> {
        TunnelLock::acquire(self.lock_path(name)).await
    }

    /// Whether the tunnel is running, and under which PID
    pub async fn status(&self, name: &TunnelName) -> Result<Liveness> {
        self.prober.probe(name).await
    }

    /// Status of every tunnel with a registry record, sorted by name
    pub async fn supervised(&self) -> Result<Vec<(TunnelName, Liveness)>> {
        let mut statuses = Vec::new();
        for name in self.registry.names().await? {
            let liveness = self.prober.probe(&name).await?;
            statuses.push((name, liveness));
        }
        Ok(statuses)
    }

    /// Last `lines` lines of the tunnel's captured output
    pub async fn tail(&self, name: &TunnelName, lines: usize) -> Result<Vec<String>> {
        self.logs.tail(name, lines).await
    }

    /// Launch the tunnel in the background and return its PID
    pub async fn start(&self, name: &TunnelName, config_path: Option<&Path>) -> Result<ProcessId> {
        let _lock = self.lock(name).await?;
        self.start_locked(name, config_path).await
    }

    /// Stop the tunnel, escalating to a forced kill after the poll window
    pub async fn stop(&self, name: &TunnelName) -> Result<StopReport> {
        // Cheap unlocked check keeps a no-op stop free of filesystem writes
        if !self.prober.probe(name).await?.is_running() {
            return Err(SupervisorError::NotRunning {
                name: name.to_string(),
            });
        }
        let _lock = self.lock(name).await?;
        self.stop_locked(name).await
    }

    /// Stop if running, pause, then start
    pub async fn restart(&self, name: &TunnelName, config_path: Option<&Path>) -> Result<ProcessId> {
        let _lock = self.lock(name).await?;
        info!("Restarting tunnel '{}'", name);

        if self.prober.probe(name).await?.is_running() {
            self.stop_locked(name).await?;
            tokio::time::sleep(self.config.timing.restart_pause()).await;
        }

        self.start_locked(name, config_path).await
    }

    /// Stop the tunnel if it is running, then delete its record, log and lock files.
    ///
    /// Nothing is deleted when the stop fails.
    pub async fn purge(&self, name: &TunnelName) -> Result<Option<StopReport>> {
        let lock = self.lock(name).await?;

        let report = if self.prober.probe(name).await?.is_running() {
            Some(self.stop_locked(name).await?)
        } else {
            None
        };

        self.registry.clear_record(name).await?;
        if self.logs.remove(name).await? {
            debug!("Removed log file: {}", self.log_path(name).display());
        }
        lock.remove().await?;

        info!("Purged tunnel '{}'", name);
        Ok(report)
    }

    async fn start_locked(&self, name: &TunnelName, config_path: Option<&Path>) -> Result<ProcessId> {
        if let Liveness::Running { pid, .. } = self.prober.probe(name).await? {
            return Err(SupervisorError::AlreadyRunning {
                name: name.to_string(),
                pid,
            });
        }
        transition(name, TunnelState::Stopped, TunnelState::Starting);

        let config = self.resolve_config(name, config_path).await;
        let spec = self.spawn_spec(name, config.as_deref());
        let log = self.logs.bind(name).await?;
        let log_path = log.path.clone();

        debug!("Spawning tunnel '{}': {}", name, spec.command_line());
        let pid = match self.host.spawn_detached(&spec, log.into_file()).await {
            Ok(pid) => pid,
            Err(source) => {
                self.registry.clear_record(name).await?;
                transition(name, TunnelState::Starting, TunnelState::Stopped);
                return Err(SupervisorError::SpawnFailed {
                    name: name.to_string(),
                    program: spec.program,
                    source,
                });
            }
        };

        if let Err(e) = self.registry.record_start(name, pid).await {
            // without a record nothing could stop it cleanly
            warn!("Killing tunnel '{}' (PID: {}) after registry write failed", name, pid);
            match self.host.force_kill(pid).await {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                TerminationResult::AccessDenied => {
                    warn!("Permission denied killing orphaned tunnel '{}' (PID: {})", name, pid);
                }
                TerminationResult::Failed(reason) => {
                    warn!(
                        "Failed to kill orphaned tunnel '{}' (PID: {}): {}",
                        name, pid, reason
                    );
                }
            }
            return Err(e);
        }

        tokio::time::sleep(self.config.timing.settle_delay()).await;

        if !self.host.is_alive(pid).await {
            self.registry.clear_record(name).await?;
            transition(name, TunnelState::Starting, TunnelState::Stopped);
            return Err(SupervisorError::StartFailed {
                name: name.to_string(),
                pid,
                log_path,
            });
        }

        info!(
            "Started tunnel '{}' (PID: {}), log file: {}",
            name,
            pid,
            log_path.display()
        );
        transition(name, TunnelState::Starting, TunnelState::Running);
        Ok(pid)
    }

    async fn stop_locked(&self, name: &TunnelName) -> Result<StopReport> {
        let Liveness::Running { pid, .. } = self.prober.probe(name).await? else {
            return Err(SupervisorError::NotRunning {
                name: name.to_string(),
            });
        };
        transition(name, TunnelState::Running, TunnelState::Stopping);

        let policy = StopPolicy::from(&self.config.timing);
        let outcome = StopSequence::new(pid, policy).run(self.host.as_ref()).await;

        // The record means nothing once a stop was attempted
        self.registry.clear_record(name).await?;

        let report = StopReport {
            name: name.clone(),
            pid,
            outcome,
        };
        match &report.outcome {
            StopOutcome::AlreadyExited | StopOutcome::Exited { .. } => {
                info!("Stopped tunnel '{}' (PID: {})", name, pid);
            }
            StopOutcome::Killed => {
                warn!(
                    "Tunnel '{}' (PID: {}) ignored SIGTERM and was killed",
                    name, pid
                );
            }
            StopOutcome::Denied => {
                return Err(SupervisorError::PermissionDenied {
                    name: name.to_string(),
                    pid,
                });
            }
            StopOutcome::Survived => {
                return Err(SupervisorError::StopTimedOut {
                    name: name.to_string(),
                    pid,
                });
            }
            StopOutcome::Failed(reason) => {
                return Err(anyhow::anyhow!(
                    "Failed to stop tunnel '{name}' (PID: {pid}): {reason}"
                )
                .into());
            }
        }

        transition(name, TunnelState::Stopping, TunnelState::Stopped);
        Ok(report)
    }

    /// Explicit path, else `{config_dir}/{name}.yml`; missing files are skipped with a warning
    async fn resolve_config(&self, name: &TunnelName, explicit: Option<&Path>) -> Option<PathBuf> {
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => self.config.default_config_path(name),
        };

        match candidate {
            Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => Some(path),
            Some(path) => {
                warn!(
                    "No config file found for tunnel '{}', expected at: {}",
                    name,
                    path.display()
                );
                None
            }
            None => {
                warn!("No config file found for tunnel '{}'", name);
                None
            }
        }
    }

    fn spawn_spec(&self, name: &TunnelName, config: Option<&Path>) -> SpawnSpec {
        let mut args = vec!["tunnel".to_string()];
        if let Some(cert) = &self.config.origin_cert {
            args.push("--origincert".to_string());
            args.push(cert.to_string_lossy().into_owned());
        }
        if let Some(config) = config {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args.push("run".to_string());
        args.push(name.to_string());

        SpawnSpec::new(self.config.program.clone(), args)
    }
}

fn transition(name: &TunnelName, from: TunnelState, to: TunnelState) {
    debug!("Tunnel '{}': {} -> {}", name, from, to);
}
