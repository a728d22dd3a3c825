//! Background supervisor for named tunnel processes.
//!
//! Tunnels are launched detached, tracked in a per-name PID record under the
//! state directory, and verified against the live process table on every
//! query.

mod factory;
mod lock;
mod logging;
mod supervisor;

pub use factory::{PlatformHost, PlatformProcessHostFactory};
pub use lock::TunnelLock;
pub use logging::{LogFormat, init_logging};
pub use supervisor::{StopReport, TunnelState, TunnelSupervisor};

pub use tunnelvisor_core::*;
