//! Process wiring: constructs the store, the LLM client, and the engines
//! once at startup, then runs the background loops and the HTTP server
//! until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use tempo_core::config::Config;
use tempo_core::store::Store;
use tempo_core::time::FallbackWindow;
use tempo_engine::{ChatOrchestrator, RetentionJob, TaskEngine};
use tempo_llm::{LanguageModel, LlmClient, OpenRouterProvider};

use crate::http_api::{api_router, AppState};
use crate::reconciler::Reconciler;
use crate::shutdown::ShutdownSignal;

/// Retention sweep cadence.
const RETENTION_SWEEP: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Daemon {
    config: Config,
    state: Arc<AppState>,
    reconciler: Arc<Reconciler>,
    retention: Arc<RetentionJob>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the configured database and wire everything to the real
    /// OpenRouter provider.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::open(config.database_path())
            .await
            .context("failed to open task database")?;
        let provider: Arc<dyn LanguageModel> =
            Arc::new(OpenRouterProvider::new(&config.openrouter_api_key));
        Ok(Self::with_parts(config, Arc::new(store), provider))
    }

    /// Assemble a daemon from pre-built parts (tests inject a mock model
    /// and an in-memory store here).
    pub fn with_parts(
        config: Config,
        store: Arc<Store>,
        provider: Arc<dyn LanguageModel>,
    ) -> Self {
        let fallback = FallbackWindow {
            start_hour: config.fallback_start_hour,
            duration_hours: config.fallback_duration_hours,
        };
        let engine = Arc::new(TaskEngine::new(store.clone(), fallback));
        let llm = Arc::new(LlmClient::new(provider, store.clone()));
        let chat = Arc::new(ChatOrchestrator::new(
            engine.clone(),
            llm.clone(),
            store.clone(),
        ));
        let retention = Arc::new(RetentionJob::new(store.clone(), config.retention_days));
        let reconciler = Arc::new(Reconciler::new(store.clone(), llm));
        let state = Arc::new(AppState {
            engine,
            chat,
            retention: retention.clone(),
            store,
            scheduler_enabled: config.scheduler_enabled,
        });
        Self {
            config,
            state,
            reconciler,
            retention,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle for triggering shutdown from another task (ctrl-c handler).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run until the shutdown signal fires. The reconciler drains its
    /// current tick; the HTTP server finishes in-flight requests.
    pub async fn run(&self) -> Result<()> {
        // First run: the settings singleton inherits the configured model.
        let settings = self
            .state
            .store
            .get_or_create_settings_with(
                self.config.llm_model.clone(),
                tempo_core::types::DEFAULT_MAX_TOKENS,
            )
            .await
            .context("failed to initialise settings")?;
        info!(model = %settings.llm_model, "active model");

        if self.config.scheduler_enabled {
            let interval = Duration::from_secs(self.config.scheduler_interval_seconds);
            tokio::spawn(
                self.reconciler
                    .clone()
                    .run(interval, self.shutdown.clone()),
            );
            info!(
                interval_secs = self.config.scheduler_interval_seconds,
                "background reconciler enabled"
            );
        } else {
            info!("background reconciler disabled by configuration");
        }

        self.spawn_retention_loop();

        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        info!(%bind_addr, "api server listening");

        let router = api_router(self.state.clone());
        let mut shutdown_rx = self.shutdown.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("api server failed")?;

        info!("daemon stopped");
        Ok(())
    }

    fn spawn_retention_loop(&self) {
        let retention = self.retention.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = retention.run().await {
                            error!(error = %err, "retention sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}
