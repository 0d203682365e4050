use tracing_subscriber::EnvFilter;

use crate::config::ClientConfig;

/// Install the global fmt subscriber. `RUST_LOG` wins over the configured
/// level. Calling this twice is a no-op.
pub fn init_tracing(config: &ClientConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
