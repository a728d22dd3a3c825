use tunnelvisor_core::ProcessHostFactory;

#[cfg(not(unix))]
compile_error!("Unsupported platform: only Unix is currently supported");

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessHostFactory;

impl ProcessHostFactory for PlatformProcessHostFactory {
    #[cfg(unix)]
    type Host = tunnelvisor_unix::UnixProcessHost;

    fn create_process_host() -> Self::Host {
        #[cfg(unix)]
        return <tunnelvisor_unix::UnixProcessHostFactory as ProcessHostFactory>::create_process_host();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return <tunnelvisor_unix::UnixProcessHostFactory as ProcessHostFactory>::platform_name();
    }
}

/// Process host of the platform this crate was built for
pub type PlatformHost = <PlatformProcessHostFactory as ProcessHostFactory>::Host;
