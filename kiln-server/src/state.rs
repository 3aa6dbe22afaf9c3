//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use kiln_core::providers::{Doubao, DoubaoConfig, Gemini, GeminiConfig, Minimax, MinimaxConfig};
use kiln_core::{
    BlobStore, CreditLedger, EntitlementService, Gate, Orchestrator, OrchestratorConfig,
    PollConfig, ProviderRegistry, Reaper, ReaperConfig, Rehomer, TaskStore,
};

use crate::blob::LocalBlobStore;
use crate::clients::{FreeLedger, HttpEntitlements, HttpLedger, StaticEntitlements};
use crate::config::Config;
use crate::db::sqlite::SqliteStore;

/// State shared across all HTTP handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The orchestration engine.
    pub orchestrator: Arc<Orchestrator>,
    /// Zombie-task reaper; handlers use it for the admin preview/sweep.
    pub reaper: Arc<Reaper>,
    /// Local artifact store; exposed for the static-file route.
    pub blobs: Arc<LocalBlobStore>,
}

impl AppState {
    /// Wire the full engine from configuration: store, collaborator clients,
    /// provider adapters, worker pool, and reaper.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn TaskStore> =
            Arc::new(SqliteStore::connect(&config.database_url).await?);
        info!(database_url = %config.database_url, "database ready");

        let blobs = Arc::new(
            LocalBlobStore::open(&config.blob_dir, &config.blob_public_url)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        );

        let entitlements: Arc<dyn EntitlementService> = match &config.entitlements_url {
            Some(url) => {
                info!(url = %url, "using entitlement service");
                Arc::new(HttpEntitlements::new(url).map_err(|e| anyhow::anyhow!(e.to_string()))?)
            }
            None => {
                warn!("no entitlement service configured, using permissive static policy");
                Arc::new(StaticEntitlements {
                    max_concurrency: config.default_max_concurrency,
                })
            }
        };

        let ledger: Arc<dyn CreditLedger> = match &config.ledger_url {
            Some(url) => {
                info!(url = %url, "using credit ledger service");
                Arc::new(HttpLedger::new(url).map_err(|e| anyhow::anyhow!(e.to_string()))?)
            }
            None => {
                warn!("no credit ledger configured, all generations are free");
                Arc::new(FreeLedger)
            }
        };

        let mut registry = ProviderRegistry::new();
        if let Some(key) = &config.minimax_api_key {
            registry = registry.register(Arc::new(
                Minimax::new(MinimaxConfig::new(key.clone()))
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?,
            ));
        }
        if let Some(key) = &config.doubao_api_key {
            registry = registry.register(Arc::new(
                Doubao::new(DoubaoConfig::new(key.clone()))
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?,
            ));
        }
        if let Some(url) = &config.gemini_url {
            registry = registry.register(Arc::new(
                Gemini::new(GeminiConfig {
                    base_url: url.clone(),
                    secret: config.gemini_secret.clone(),
                })
                .map_err(|e| anyhow::anyhow!(e.to_string()))?,
            ));
        }
        let registry = Arc::new(registry);
        info!(providers = ?registry.ids(), "provider adapters registered");

        let gate = Arc::new(Gate::new(entitlements, ledger));
        let rehomer = Arc::new(
            Rehomer::new(blobs.clone() as Arc<dyn BlobStore>)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        );

        let orchestrator = Orchestrator::start(
            store.clone(),
            gate.clone(),
            registry,
            rehomer,
            OrchestratorConfig {
                workers: config.workers,
                queue_capacity: config.queue_capacity,
                poll: PollConfig {
                    interval: Duration::from_secs(config.poll_interval_secs),
                    max_attempts: config.poll_max_attempts,
                },
                ..Default::default()
            },
        );

        let reaper = Arc::new(Reaper::new(
            store,
            gate,
            ReaperConfig {
                stale_after: Duration::from_secs(config.reaper_stale_after_secs),
                interval: Duration::from_secs(config.reaper_interval_secs),
            },
        ));

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            reaper,
            blobs,
        })
    }
}
