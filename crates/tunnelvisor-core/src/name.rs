use crate::error::{Result, SupervisorError};
use std::fmt;

/// User-chosen tunnel identifier, used verbatim in registry and log file names
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunnelName(String);

impl TunnelName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name == "." || name == ".." {
            Some("name is a relative path component")
        } else if name.contains(['/', '\\']) {
            Some("name contains a path separator")
        } else if name.contains('\0') {
            Some("name contains a NUL byte")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SupervisorError::InvalidName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TunnelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for TunnelName {
    type Error = SupervisorError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for TunnelName {
    type Error = SupervisorError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}
