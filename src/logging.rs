use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::sampling::SamplingConfig;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init();

    if result.is_ok() {
        info!(level = %config.level, "logging initialized");
    }
}

pub(crate) fn log_section(title: &str, body: &str) {
    info!("{}:\n{}\n", title, body);
}

pub(crate) fn log_generation_params(request_id: &str, seed: u32, config: &SamplingConfig) {
    match serde_json::to_string(config) {
        Ok(params) => info!(request_id, seed, params = %params, "generation parameters"),
        Err(e) => info!(request_id, seed, error = %e, "generation parameters not serializable"),
    }
}
