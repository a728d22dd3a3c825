//! Graceful-then-forced stop as an explicit state machine.
//!
//! ```text
//! Graceful --SIGTERM--> Waiting { attempt } --gone--> Finished(Exited)
//!                            | attempts exhausted
//!                            v
//!                         Forced --SIGKILL--> Confirming --> Finished(Killed | Survived)
//! ```

use crate::config::SupervisorTiming;
use crate::process::{ProcessHost, ProcessId, TerminationResult};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a stop attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was gone before the first signal landed
    AlreadyExited,
    /// Exited after SIGTERM within the poll window
    Exited { polls: u32 },
    /// Needed SIGKILL
    Killed,
    /// Still present after SIGKILL and one more interval
    Survived,
    /// Signalling was refused by the OS
    Denied,
    /// Signalling failed for another reason
    Failed(String),
}

impl StopOutcome {
    /// The process is confirmed gone
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            StopOutcome::AlreadyExited | StopOutcome::Exited { .. } | StopOutcome::Killed
        )
    }

    pub fn was_escalated(&self) -> bool {
        matches!(self, StopOutcome::Killed | StopOutcome::Survived)
    }
}

/// Current position of a [`StopSequence`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopState {
    Graceful,
    Waiting { attempt: u32 },
    Forced,
    Confirming,
    Finished(StopOutcome),
}

/// Bounded wait policy for a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl From<&SupervisorTiming> for StopPolicy {
    fn from(timing: &SupervisorTiming) -> Self {
        Self {
            poll_interval: timing.stop_poll_interval(),
            max_attempts: timing.stop_max_attempts,
        }
    }
}

pub struct StopSequence {
    pid: ProcessId,
    policy: StopPolicy,
    state: StopState,
}

impl StopSequence {
    pub fn new(pid: ProcessId, policy: StopPolicy) -> Self {
        Self {
            pid,
            policy,
            state: StopState::Graceful,
        }
    }

    pub fn state(&self) -> &StopState {
        &self.state
    }

    /// Advance one transition; sleeps only while waiting or confirming
    pub async fn step<H: ProcessHost + ?Sized>(&mut self, host: &H) -> &StopState {
        let pid = self.pid;
        self.state = match std::mem::replace(&mut self.state, StopState::Graceful) {
            StopState::Graceful => match host.terminate_gracefully(pid).await {
                TerminationResult::Success => {
                    info!("Sent SIGTERM to process {}", pid);
                    StopState::Waiting { attempt: 0 }
                }
                TerminationResult::ProcessNotFound => {
                    info!("Process {} not found (already terminated)", pid);
                    StopState::Finished(StopOutcome::AlreadyExited)
                }
                TerminationResult::AccessDenied => {
                    warn!("Permission denied to terminate process {}", pid);
                    StopState::Finished(StopOutcome::Denied)
                }
                TerminationResult::Failed(reason) => {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, reason);
                    StopState::Finished(StopOutcome::Failed(reason))
                }
            },
            StopState::Waiting { attempt } => {
                if !host.is_alive(pid).await {
                    debug!("Process {} exited after {} polls", pid, attempt);
                    StopState::Finished(StopOutcome::Exited { polls: attempt })
                } else if attempt + 1 >= self.policy.max_attempts {
                    tokio::time::sleep(self.policy.poll_interval).await;
                    StopState::Forced
                } else {
                    tokio::time::sleep(self.policy.poll_interval).await;
                    StopState::Waiting {
                        attempt: attempt + 1,
                    }
                }
            }
            StopState::Forced => {
                warn!(
                    "Process {} still running after {} checks, escalating to SIGKILL",
                    pid, self.policy.max_attempts
                );
                match host.force_kill(pid).await {
                    TerminationResult::Success => {
                        info!("Sent SIGKILL to process {}", pid);
                        tokio::time::sleep(self.policy.poll_interval).await;
                        StopState::Confirming
                    }
                    TerminationResult::ProcessNotFound => {
                        info!("Process {} exited before SIGKILL", pid);
                        StopState::Finished(StopOutcome::Exited {
                            polls: self.policy.max_attempts,
                        })
                    }
                    TerminationResult::AccessDenied => {
                        warn!("Permission denied to kill process {}", pid);
                        StopState::Finished(StopOutcome::Denied)
                    }
                    TerminationResult::Failed(reason) => {
                        warn!("Failed to send SIGKILL to process {}: {}", pid, reason);
                        StopState::Finished(StopOutcome::Failed(reason))
                    }
                }
            }
            StopState::Confirming => {
                if host.is_alive(pid).await {
                    warn!("Process {} survived SIGKILL", pid);
                    StopState::Finished(StopOutcome::Survived)
                } else {
                    StopState::Finished(StopOutcome::Killed)
                }
            }
            finished @ StopState::Finished(_) => finished,
        };
        &self.state
    }

    /// Drive the sequence until it finishes
    pub async fn run<H: ProcessHost + ?Sized>(mut self, host: &H) -> StopOutcome {
        loop {
            if let StopState::Finished(outcome) = self.step(host).await {
                return outcome.clone();
            }
        }
    }
}
