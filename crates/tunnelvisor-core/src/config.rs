use crate::error::SupervisorError;
use crate::name::TunnelName;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delays and bounds used by start, stop and restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorTiming {
    /// How long a freshly spawned process must survive to count as started (in milliseconds)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Interval between existence checks while waiting for a graceful exit (in milliseconds)
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,

    /// Number of existence checks before escalating to a forced kill
    #[serde(default = "default_stop_max_attempts")]
    pub stop_max_attempts: u32,

    /// Pause between stop and start during a restart, lets ports and file handles go (in milliseconds)
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            stop_max_attempts: default_stop_max_attempts(),
            restart_pause_ms: default_restart_pause_ms(),
        }
    }
}

impl SupervisorTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// No waiting at all; the stop sequence still polls `stop_max_attempts` times
    pub fn immediate() -> Self {
        Self {
            settle_delay_ms: 0,
            stop_poll_interval_ms: 0,
            stop_max_attempts: default_stop_max_attempts(),
            restart_pause_ms: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        const MAX_DELAY_MS: u64 = 60_000;

        if self.stop_max_attempts == 0 {
            return Err(anyhow::anyhow!("stop_max_attempts must be at least 1"));
        }

        if self.stop_max_attempts > 60 {
            return Err(anyhow::anyhow!(
                "stop_max_attempts should not exceed 60 to keep stop bounded"
            ));
        }

        for (field, value) in [
            ("settle_delay_ms", self.settle_delay_ms),
            ("stop_poll_interval_ms", self.stop_poll_interval_ms),
            ("restart_pause_ms", self.restart_pause_ms),
        ] {
            if value > MAX_DELAY_MS {
                return Err(anyhow::anyhow!("{field} should not exceed 60 seconds"));
            }
        }

        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }

    /// Longest a stop can take before giving up: the poll window plus one confirmation interval
    pub fn stop_budget(&self) -> Duration {
        self.stop_poll_interval() * (self.stop_max_attempts + 1)
    }
}

/// Main supervisor configuration
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct SupervisorConfig {
    /// External tunnel tool, looked up on `PATH` unless absolute
    #[builder(default = "default_program()")]
    pub program: String,
    /// Directory holding the `.pid`, `.log` and `.lock` files
    #[builder(default = "std::env::temp_dir()")]
    pub state_dir: PathBuf,
    /// File name prefix, `{prefix}-{name}.pid`
    #[builder(default = "self.default_file_prefix()")]
    pub file_prefix: String,
    /// Where `{name}.yml` default configs live
    #[builder(default = "default_config_dir()")]
    pub config_dir: Option<PathBuf>,
    #[builder(default)]
    pub origin_cert: Option<PathBuf>,
    #[builder(default)]
    pub timing: SupervisorTiming,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            state_dir: std::env::temp_dir(),
            file_prefix: default_program(),
            config_dir: default_config_dir(),
            origin_cert: None,
            timing: SupervisorTiming::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.program.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "program cannot be empty".to_string(),
            ));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains('/') {
            return Err(SupervisorError::InvalidConfig(format!(
                "invalid file prefix {:?}",
                self.file_prefix
            )));
        }
        self.timing
            .validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))
    }

    /// Binary name the kernel reports for the tunnel tool
    pub fn binary_name(&self) -> &str {
        binary_name(&self.program)
    }

    /// `{config_dir}/{name}.yml`, when a config directory is known
    pub fn default_config_path(&self, name: &TunnelName) -> Option<PathBuf> {
        self.config_dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.yml")))
    }
}

impl SupervisorConfigBuilder {
    /// Never look for a name-derived default config
    pub fn no_config_dir(&mut self) -> &mut Self {
        self.config_dir = Some(None);
        self
    }

    fn default_file_prefix(&self) -> String {
        match &self.program {
            Some(program) => binary_name(program).to_string(),
            None => default_program(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(program) = &self.program {
            if program.trim().is_empty() {
                return Err("program cannot be empty".to_string());
            }
        }
        if let Some(prefix) = &self.file_prefix {
            if prefix.is_empty() || prefix.contains('/') {
                return Err(format!("invalid file prefix {prefix:?}"));
            }
        }
        if let Some(timing) = &self.timing {
            timing.validate().map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl From<SupervisorConfigBuilderError> for SupervisorError {
    fn from(error: SupervisorConfigBuilderError) -> Self {
        SupervisorError::InvalidConfig(error.to_string())
    }
}

fn binary_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

// Default value functions for serde
fn default_program() -> String {
    "cloudflared".to_string()
}
fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cloudflared"))
}
fn default_settle_delay_ms() -> u64 {
    2_000
}
fn default_stop_poll_interval_ms() -> u64 {
    1_000
}
fn default_stop_max_attempts() -> u32 {
    10
}
fn default_restart_pause_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let timing = SupervisorTiming::default();
        assert!(timing.validate().is_ok());
        assert_eq!(timing.settle_delay(), Duration::from_secs(2));
        assert_eq!(timing.stop_poll_interval(), Duration::from_secs(1));
        assert_eq!(timing.stop_max_attempts, 10);
        assert_eq!(timing.restart_pause(), Duration::from_secs(2));
        assert_eq!(timing.stop_budget(), Duration::from_secs(11));
    }

    #[test]
    fn test_immediate_timing() {
        let timing = SupervisorTiming::immediate();
        assert!(timing.validate().is_ok());
        assert_eq!(timing.settle_delay(), Duration::ZERO);
        assert_eq!(timing.stop_budget(), Duration::ZERO);
    }

    #[test]
    fn test_invalid_timing() {
        let mut timing = SupervisorTiming {
            stop_max_attempts: 0,
            ..Default::default()
        };
        assert!(timing.validate().is_err());

        timing.stop_max_attempts = 10;
        timing.settle_delay_ms = 120_000;
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_timing_serialization_uses_defaults() {
        let timing: SupervisorTiming = serde_json::from_str(r#"{"settleDelayMs": 500}"#).unwrap();
        assert_eq!(timing.settle_delay_ms, 500);
        assert_eq!(timing.stop_max_attempts, 10);

        let json = serde_json::to_string(&SupervisorTiming::immediate()).unwrap();
        assert!(json.contains("stopPollIntervalMs"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = SupervisorConfig::builder().build().unwrap();
        assert_eq!(config.program, "cloudflared");
        assert_eq!(config.file_prefix, "cloudflared");
        assert_eq!(config.state_dir, std::env::temp_dir());
        assert!(config.origin_cert.is_none());
        assert_eq!(config.timing, SupervisorTiming::default());
    }

    #[test]
    fn test_prefix_follows_program_basename() {
        let config = SupervisorConfig::builder()
            .program("/opt/bin/fake-tunnel")
            .no_config_dir()
            .build()
            .unwrap();
        assert_eq!(config.file_prefix, "fake-tunnel");
        assert_eq!(config.binary_name(), "fake-tunnel");
        assert!(config.config_dir.is_none());
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(SupervisorConfig::builder().program("  ").build().is_err());
        assert!(SupervisorConfig::builder().file_prefix("a/b").build().is_err());

        let error: SupervisorError = SupervisorConfig::builder()
            .timing(SupervisorTiming {
                stop_max_attempts: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err()
            .into();
        assert!(matches!(error, SupervisorError::InvalidConfig(_)));
    }

    #[test]
    fn test_default_config_path() {
        let config = SupervisorConfig::builder()
            .config_dir("/home/u/.cloudflared")
            .build()
            .unwrap();
        let name = TunnelName::new("demo").unwrap();
        assert_eq!(
            config.default_config_path(&name),
            Some(PathBuf::from("/home/u/.cloudflared/demo.yml"))
        );
    }
}
