//! tempo daemon — serves the task API and runs the schedule reconciler.

use anyhow::Result;
use tracing::info;

use tempo_core::config::Config;
use tempo_daemon::daemon::Daemon;
use tempo_daemon::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Misconfiguration is fatal; refuse to start.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_level, config.log_format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %config.llm_model,
        "tempo daemon starting"
    );

    let daemon = Daemon::new(config).await?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, shutting down");
        shutdown.trigger();
    });

    daemon.run().await
}
