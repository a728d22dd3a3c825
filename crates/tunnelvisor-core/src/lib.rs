//! tunnelvisor core - platform-independent pieces of the tunnel supervisor
//!
//! This crate provides the process-host traits, the on-disk registry and log
//! sink, the liveness prober and the stop state machine. Platform crates
//! implement [`ProcessHost`]; the `tunnelvisor` crate wires it all together.

mod config;
mod error;
mod logs;
mod name;
mod process;
mod prober;
mod registry;
mod stop;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::*;
pub use error::*;
pub use logs::*;
pub use name::*;
pub use process::*;
pub use prober::*;
pub use registry::*;
pub use stop::*;
