use async_trait::async_trait;
use std::fmt;
use std::fs::File;

/// OS-level process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Everything needed to launch one detached tunnel process
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new<S: ToString, I: IntoIterator<Item = S>>(program: impl Into<String>, args: I) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Full command line, space separated, for logs and diagnostics
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Match over a process argument vector.
///
/// Some argument must contain `program` (so absolute paths and interpreter
/// invocations of a script still match); after it, every entry of `args`
/// must appear in order as a whole argument. `run web` therefore never
/// matches a process running `web-staging`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPattern {
    program: String,
    args: Vec<String>,
}

impl CommandPattern {
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(program: impl Into<String>, args: I) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Pattern for `<tool> ... tunnel ... run ... <name>`
    pub fn tunnel_run(tool: &str, name: &str) -> Self {
        Self::new(tool, ["tunnel", "run", name])
    }

    pub fn matches<S: AsRef<str>>(&self, argv: &[S]) -> bool {
        let Some(start) = argv
            .iter()
            .position(|arg| arg.as_ref().contains(self.program.as_str()))
        else {
            return false;
        };

        let mut rest = argv[start + 1..].iter();
        self.args
            .iter()
            .all(|expected| rest.any(|arg| arg.as_ref() == expected))
    }
}

impl fmt::Display for CommandPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " .. {arg}")?;
        }
        Ok(())
    }
}

/// Whether a kernel-reported command name denotes `expected`.
///
/// Linux truncates `comm` to 15 bytes, so a full-length name that is a
/// prefix of the expected binary also counts.
pub fn command_name_matches(command_name: &str, expected: &str) -> bool {
    const COMM_LEN: usize = 15;
    if command_name.is_empty() || expected.is_empty() {
        return false;
    }
    command_name.contains(expected)
        || (command_name.len() >= COMM_LEN && expected.starts_with(command_name))
}

/// Launching and observing processes
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn `spec` in a new session with stdout and stderr both written to `log`
    async fn spawn_detached(&self, spec: &SpawnSpec, log: File) -> std::io::Result<ProcessId>;

    /// Zero-effect existence probe (signal 0 on Unix); reaped or zombie processes count as gone
    async fn is_alive(&self, pid: ProcessId) -> bool;
}

/// Looking up what a process is
#[async_trait]
pub trait ProcessInspection: Send + Sync {
    /// Short command name of `pid`, if it exists
    async fn command_name(&self, pid: ProcessId) -> Option<String>;

    /// Every process (other than the caller) whose arguments match `pattern`, ascending
    async fn find_by_command_line(&self, pattern: &CommandPattern) -> Vec<ProcessId>;
}

/// Sending termination signals
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Kill the process unconditionally (SIGKILL on Unix)
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;
}

/// Platform process host that combines lifecycle, inspection and termination
pub trait ProcessHost: ProcessLifecycle + ProcessInspection + ProcessTermination {
    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Factory trait for creating the process host of the current platform
pub trait ProcessHostFactory {
    /// The type of process host this factory creates
    type Host: ProcessHost;

    fn create_process_host() -> Self::Host;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(command_line: &str) -> Vec<&str> {
        command_line.split_whitespace().collect()
    }

    #[test]
    fn test_pattern_matches_in_order() {
        let pattern = CommandPattern::tunnel_run("cloudflared", "demo");
        assert!(pattern.matches(&argv("cloudflared tunnel run demo")));
        assert!(pattern.matches(&argv(
            "/usr/local/bin/cloudflared tunnel --config /home/u/.cloudflared/demo.yml run demo"
        )));
        assert!(pattern.matches(&argv("/bin/sh /opt/cloudflared tunnel run demo")));
        assert!(!pattern.matches(&argv("cloudflared tunnel list")));
        assert!(!pattern.matches(&argv("demo run tunnel cloudflared")));
        assert!(!pattern.matches::<&str>(&[]));
        assert_eq!(pattern.to_string(), "cloudflared .. tunnel .. run .. demo");
    }

    #[test]
    fn test_name_must_be_a_whole_argument() {
        let web = CommandPattern::tunnel_run("cloudflared", "web");
        assert!(!web.matches(&argv("cloudflared tunnel run web-staging")));
        assert!(!web.matches(&argv("cloudflared tunnel run staging-web")));
        assert!(web.matches(&argv("cloudflared tunnel run web")));
        // a config path mentioning the name is not the name
        assert!(!web.matches(&argv("cloudflared tunnel --config /etc/web.yml run api")));
    }

    #[test]
    fn test_name_with_spaces_is_one_argument() {
        let pattern = CommandPattern::tunnel_run("cloudflared", "my tunnel");
        assert!(pattern.matches(&["cloudflared", "tunnel", "run", "my tunnel"]));
        assert!(!pattern.matches(&["cloudflared", "tunnel", "run", "my", "tunnel"]));
    }

    #[test]
    fn test_command_name_matching() {
        assert!(command_name_matches("cloudflared", "cloudflared"));
        assert!(!command_name_matches("sleep", "cloudflared"));
        assert!(!command_name_matches("", "cloudflared"));
        // truncated comm of a long binary name
        assert!(command_name_matches(
            "very-long-tunne",
            "very-long-tunnel-binary"
        ));
        assert!(!command_name_matches("very", "very-long-tunnel-binary"));
    }

    #[test]
    fn test_spawn_spec_command_line() {
        let spec = SpawnSpec::new("cloudflared", ["tunnel", "run", "demo"]);
        assert_eq!(spec.command_line(), "cloudflared tunnel run demo");
        assert_eq!(ProcessId(12).to_string(), "12");
    }
}
