#[cfg(unix)]
mod unix_impl {
    use async_trait::async_trait;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::collections::HashMap;
    use std::fs::File;
    use std::process::Stdio;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};
    use tunnelvisor_core::{
        CommandPattern, ProcessHost, ProcessId, ProcessInspection, ProcessLifecycle,
        ProcessTermination, SpawnSpec, TerminationResult,
    };

    /// Unix process host: `setsid` spawns, signal-0 probes and `/proc`-style scans via sysinfo
    pub struct UnixProcessHost {
        system: Mutex<System>,
        /// Children spawned by this host, kept so their exit status can be reaped
        children: Mutex<HashMap<ProcessId, Child>>,
    }

    impl Default for UnixProcessHost {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessHost {
        pub fn new() -> Self {
            debug!("Initializing Unix process host");
            Self {
                system: Mutex::new(System::new()),
                children: Mutex::new(HashMap::new()),
            }
        }

        fn system(&self) -> MutexGuard<'_, System> {
            self.system.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn children(&self) -> MutexGuard<'_, HashMap<ProcessId, Child>> {
            self.children.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Reap our own child if it exited; `None` when it is not ours
        fn reap_child(&self, pid: ProcessId) -> Option<bool> {
            let mut children = self.children();
            let child = children.get_mut(&pid)?;
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("Unix process {} exited with {}", pid, status);
                    children.remove(&pid);
                    Some(false)
                }
                Ok(None) => Some(true),
                Err(e) => {
                    warn!("Failed to poll child process {}: {}", pid, e);
                    None
                }
            }
        }

        fn is_zombie(&self, pid: ProcessId) -> bool {
            let sys_pid = sysinfo::Pid::from_u32(pid.0);
            let mut system = self.system();
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sys_pid]),
                true,
                ProcessRefreshKind::nothing(),
            );
            system
                .process(sys_pid)
                .is_some_and(|process| process.status() == sysinfo::ProcessStatus::Zombie)
        }

        fn send(&self, pid: ProcessId, sig: Signal) -> TerminationResult {
            let Some(nix_pid) = to_nix_pid(pid) else {
                return TerminationResult::ProcessNotFound;
            };

            match signal::kill(nix_pid, sig) {
                Ok(()) => {
                    info!("Sent {} to process {}", sig, pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to send {} to process {}", sig, pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send {} to process {}: {}", sig, pid, e);
                    TerminationResult::Failed(format!("{sig} failed: {e}"))
                }
            }
        }
    }

    /// PID 0 and values past `i32::MAX` would address process groups, never a single process
    fn to_nix_pid(pid: ProcessId) -> Option<NixPid> {
        i32::try_from(pid.0)
            .ok()
            .filter(|raw| *raw > 0)
            .map(NixPid::from_raw)
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessHost {
        async fn spawn_detached(&self, spec: &SpawnSpec, log: File) -> std::io::Result<ProcessId> {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(log.try_clone()?))
                .stderr(Stdio::from(log));

            // New session so the tunnel outlives the invoking terminal
            // SAFETY: setsid is async-signal-safe and touches no parent state
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }

            let child = cmd.spawn()?;
            let pid = child
                .id()
                .map(ProcessId::from)
                .ok_or_else(|| std::io::Error::other("spawned process has no PID"))?;

            info!(
                "Spawned Unix process: {} (PID: {}) with args: {:?}",
                spec.program, pid, spec.args
            );
            self.children().insert(pid, child);
            Ok(pid)
        }

        async fn is_alive(&self, pid: ProcessId) -> bool {
            if let Some(running) = self.reap_child(pid) {
                return running;
            }

            let Some(nix_pid) = to_nix_pid(pid) else {
                return false;
            };
            // Send signal 0 to check if process exists
            match signal::kill(nix_pid, None) {
                Ok(()) | Err(nix::errno::Errno::EPERM) => !self.is_zombie(pid),
                Err(_) => {
                    debug!("Unix process {} is no longer running", pid);
                    false
                }
            }
        }
    }

    #[async_trait]
    impl ProcessInspection for UnixProcessHost {
        async fn command_name(&self, pid: ProcessId) -> Option<String> {
            let sys_pid = sysinfo::Pid::from_u32(pid.0);
            let mut system = self.system();
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sys_pid]),
                true,
                ProcessRefreshKind::nothing(),
            );
            system
                .process(sys_pid)
                .map(|process| process.name().to_string_lossy().into_owned())
        }

        async fn find_by_command_line(&self, pattern: &CommandPattern) -> Vec<ProcessId> {
            let own_pid = std::process::id();
            let mut system = self.system();
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
            );

            let mut matches: Vec<ProcessId> = system
                .processes()
                .iter()
                .filter(|(pid, process)| {
                    pid.as_u32() != own_pid
                        && process.status() != sysinfo::ProcessStatus::Zombie
                        && !process.cmd().is_empty()
                })
                .filter(|(_, process)| {
                    let argv: Vec<_> = process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect();
                    pattern.matches(&argv)
                })
                .map(|(pid, _)| ProcessId::from(pid.as_u32()))
                .collect();

            matches.sort();
            debug!("Command line scan for {} found {:?}", pattern, matches);
            matches
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessHost {
        async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            self.send(pid, Signal::SIGTERM)
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            self.send(pid, Signal::SIGKILL)
        }
    }

    impl ProcessHost for UnixProcessHost {
        fn platform_name(&self) -> &'static str {
            "Unix"
        }
    }

}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::UnixProcessHost;

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessHost;

#[cfg(not(unix))]
impl UnixProcessHost {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessHost {
    fn default() -> Self {
        Self::new()
    }
}
