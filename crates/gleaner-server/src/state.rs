use std::sync::Arc;

use gleaner_client::{ClientFetcherFactory, HtmlQuery, HttpFetcher};
use gleaner_core::{DedupStore, JobOrchestrator, OrchestratorConfig, ScrapeManager};
use gleaner_db::{Database, HistoryRepository};

pub type ServerManager = ScrapeManager<ClientFetcherFactory, HtmlQuery, HistoryRepository>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub manager: ServerManager,
    pub db: Database,
    /// Bearer token required on every `/v1` route.
    pub api_key: String,
}

impl AppState {
    /// Wire the job manager to `db` for history. `http` decides whether
    /// private addresses may be fetched.
    pub fn new(
        db: Database,
        api_key: impl Into<String>,
        http: HttpFetcher,
        dedup: Arc<DedupStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let orchestrator = JobOrchestrator::new(
            ClientFetcherFactory::new(http),
            HtmlQuery,
            db.history_repo(),
            dedup,
            config,
        );
        Self {
            manager: ScrapeManager::new(orchestrator),
            db,
            api_key: api_key.into(),
        }
    }
}
