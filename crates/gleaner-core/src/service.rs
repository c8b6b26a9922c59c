//! Caller-facing job management: submit, poll, cancel, and the one-shot
//! selector and URL checks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{TimeDelta, Utc};

use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::{self, SelectorPreview};
use crate::job::{JobSnapshot, JobState};
use crate::models::{FieldSelector, ScrapeConfig, Selector};
use crate::orchestrator::{JobOrchestrator, TracingJobReporter};
use crate::traits::{FetcherFactory, HistorySink, PageFetcher, StructuredQuery, UrlCheck};

/// Values shown by [`ScrapeManager::test_selector`].
pub const PREVIEW_LIMIT: usize = 10;

struct JobEntry {
    state: Arc<watch::Sender<JobState>>,
    cancel: CancellationToken,
}

/// Runs jobs in the background and keeps their state pollable.
///
/// At most `max_concurrent_jobs` run at once; the rest wait as `queued`.
/// Finished jobs are forgotten once `job_retention` has passed since they
/// ended.
pub struct ScrapeManager<FF, Q, H>
where
    FF: FetcherFactory,
    Q: StructuredQuery,
    H: HistorySink,
{
    orchestrator: Arc<JobOrchestrator<FF, Q, H>>,
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
    permits: Arc<Semaphore>,
}

impl<FF, Q, H> Clone for ScrapeManager<FF, Q, H>
where
    FF: FetcherFactory,
    Q: StructuredQuery,
    H: HistorySink,
{
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            jobs: Arc::clone(&self.jobs),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<FF, Q, H> ScrapeManager<FF, Q, H>
where
    FF: FetcherFactory,
    Q: StructuredQuery,
    H: HistorySink,
{
    pub fn new(orchestrator: JobOrchestrator<FF, Q, H>) -> Self {
        let permits = orchestrator.config().max_concurrent_jobs.max(1);
        Self {
            orchestrator: Arc::new(orchestrator),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn orchestrator(&self) -> &JobOrchestrator<FF, Q, H> {
        &self.orchestrator
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<Uuid, JobEntry>> {
        self.jobs.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Job table lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, JobEntry>> {
        self.jobs.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Job table lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Drop terminal jobs whose retention has run out.
    fn purge_expired(&self) {
        let Ok(retention) = TimeDelta::from_std(self.orchestrator.config().job_retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        self.write_jobs().retain(|id, entry| {
            let state = entry.state.borrow();
            let expired = state.status.is_terminal()
                && state.stats.end_time.is_some_and(|end| end <= cutoff);
            if expired {
                tracing::debug!(job_id = %id, "Forgetting expired job");
            }
            !expired
        });
    }

    /// Validate `config` and start the job in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, config: ScrapeConfig) -> Result<Uuid, AppError> {
        config.validate()?;
        self.purge_expired();

        let id = Uuid::new_v4();
        let (state, _) = watch::channel(JobState::new(id, config.url.clone()));
        let state = Arc::new(state);
        let cancel = CancellationToken::new();

        self.write_jobs().insert(
            id,
            JobEntry {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
            },
        );
        tracing::info!(job_id = %id, url = %config.url, "Job submitted");

        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                orchestrator.abandon(&state, &TracingJobReporter).await;
                return;
            };
            orchestrator
                .run(&config, &state, &cancel, &TracingJobReporter)
                .await;
        });

        Ok(id)
    }

    /// Current snapshot; includes records once the job is terminal.
    pub fn status(&self, id: Uuid) -> Result<JobSnapshot, AppError> {
        self.purge_expired();
        let jobs = self.read_jobs();
        let entry = jobs.get(&id).ok_or(AppError::JobNotFound(id))?;
        let snapshot = entry.state.borrow().snapshot();
        Ok(snapshot)
    }

    /// Live state updates for one job.
    pub fn subscribe(&self, id: Uuid) -> Result<watch::Receiver<JobState>, AppError> {
        let jobs = self.read_jobs();
        let entry = jobs.get(&id).ok_or(AppError::JobNotFound(id))?;
        Ok(entry.state.subscribe())
    }

    /// Wait until the job is terminal and return its final snapshot.
    pub async fn wait(&self, id: Uuid) -> Result<JobSnapshot, AppError> {
        let mut rx = self.subscribe(id)?;
        let state = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| AppError::JobNotFound(id))?;
        Ok(state.snapshot())
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.purge_expired();
        let mut snapshots: Vec<JobSnapshot> = self
            .read_jobs()
            .values()
            .map(|entry| entry.state.borrow().snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Request cancellation and return the state as of the request. A queued
    /// job fails as soon as its task wakes; a running one stops at its next
    /// suspension point. Either way it is recorded in history before the
    /// failure is published. Terminal jobs are left as they are.
    pub fn cancel(&self, id: Uuid) -> Result<JobSnapshot, AppError> {
        let jobs = self.read_jobs();
        let entry = jobs.get(&id).ok_or(AppError::JobNotFound(id))?;
        entry.cancel.cancel();
        tracing::info!(job_id = %id, "Job cancellation requested");
        let snapshot = entry.state.borrow().snapshot();
        Ok(snapshot)
    }

    /// Fetch `url` once and evaluate a single selector against it.
    pub async fn test_selector(
        &self,
        url: &str,
        selector: Selector,
        render: bool,
    ) -> Result<SelectorPreview, AppError> {
        let mut config =
            ScrapeConfig::new(url).with_field(FieldSelector::new("preview", selector.clone()));
        config.use_javascript_rendering = render;
        config.validate()?;

        let fetcher = self.orchestrator.factory().create(&config).await?;
        let page = fetcher.fetch(url, None).await?;
        let document = self.orchestrator.query().parse(&page.body);
        extract::preview(&document, &page.url, &selector, PREVIEW_LIMIT)
    }

    /// Lightweight reachability check.
    pub async fn validate_url(&self, url: &str) -> Result<UrlCheck, AppError> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::ValidationError(format!("invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::ValidationError(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }
        let fetcher = self
            .orchestrator
            .factory()
            .create(&ScrapeConfig::new(url))
            .await?;
        fetcher.probe(url).await
    }

    /// Forget every fingerprint and persist the empty set.
    pub async fn clear_dedup(&self) -> Result<usize, AppError> {
        let dedup = self.orchestrator.dedup();
        let dropped = dedup.clear();
        dedup.persist().await?;
        tracing::info!(dropped, "Dedup store cleared");
        Ok(dropped)
    }
}
