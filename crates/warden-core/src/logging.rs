use crate::Result;

/// Initialize logging for a warden binary.
///
/// Library code only emits `tracing` events; the subscriber is installed here
/// when the `subscriber` feature is enabled. Without it this is a no-op so the
/// public API stays stable.
pub fn init(service_name: &str) -> Result<()> {
    let _ = service_name;

    #[cfg(feature = "subscriber")]
    {
        use tracing_subscriber::{fmt, EnvFilter};

        // Default: info for our crates, warn for everything else.
        // Can be overridden with `RUST_LOG`.
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "warn,warden=info,warden_core=info,warden_telegram=info,{}=info",
                service_name.replace('-', "_")
            ))
        });

        // `try_init` so tests and embedders that already installed a subscriber keep theirs.
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .try_init();
    }

    Ok(())
}
