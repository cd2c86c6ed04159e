//! Thin logging facade over `tracing`.
//!
//! Call sites use `logging::warn(...)` and friends so the backend can change
//! without touching them.

use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber. Safe to call more than once.
pub fn init(verbose: bool) {
    let default = if verbose { "turnwise=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn info(message: impl AsRef<str>) {
    tracing::info!("{}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    tracing::warn!("{}", message.as_ref());
}

pub fn error(message: impl AsRef<str>) {
    tracing::error!("{}", message.as_ref());
}
