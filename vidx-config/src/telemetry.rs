use anyhow::anyhow;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::LoggingConfig;

/// `RUST_LOG` wins over the configured filter when set.
pub fn env_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter)
        .map_err(|err| anyhow!("invalid logging.filter {:?}: {err}", config.filter))
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn install_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(config)?)
        .with(
            fmt::layer()
                .with_ansi(config.ansi)
                .with_target(config.with_target),
        )
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
