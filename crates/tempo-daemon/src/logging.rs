use tempo_core::config::LogFormat;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies.
/// Safe to call more than once (tests): later calls are no-ops.
pub fn init_logging(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Standard => {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .try_init()
                .ok();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .try_init()
                .ok();
        }
    }
    tracing::info!(format = ?format, "logging initialised");
}
