mod unix_process_host;

pub use unix_process_host::UnixProcessHost;

#[cfg(unix)]
pub struct UnixProcessHostFactory;

#[cfg(unix)]
impl tunnelvisor_core::ProcessHostFactory for UnixProcessHostFactory {
    type Host = UnixProcessHost;

    fn create_process_host() -> Self::Host {
        UnixProcessHost::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
