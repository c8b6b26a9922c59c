//! Drives one scrape job from `queued` to a terminal state.
//!
//! Pages are fetched with bounded concurrency but aggregated strictly in
//! page order. The rate limiter, not the concurrency bound, gates
//! throughput. Live state is published through a `watch` channel so callers
//! can poll or subscribe.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dedup::DedupStore;
use crate::error::AppError;
use crate::extract::{self, PageExtraction};
use crate::fetcher::JobFetcher;
use crate::job::{JobSnapshot, JobState, JobStatus, PageFailure, Stats};
use crate::models::{ScrapeConfig, compute_hash};
use crate::pagination;
use crate::proxy_pool::{ProxyPool, ProxyPoolConfig};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::traits::{
    FetchedPage, FetcherFactory, HistoryEntry, HistorySink, PageFetcher, StructuredQuery,
};

/// Engine tunables shared by every job.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pages fetched concurrently within one job.
    pub page_concurrency: usize,
    /// Upper bound on a single retry backoff.
    pub max_retry_delay: Duration,
    /// Consecutive failures after which a proxy is banned.
    pub proxy_ban_threshold: u32,
    /// Idle time after which a banned proxy becomes suspect again.
    pub proxy_recovery_timeout: Option<Duration>,
    /// Jobs running at once in a [`crate::service::ScrapeManager`].
    pub max_concurrent_jobs: usize,
    /// How long a finished job stays pollable before it is forgotten.
    pub job_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_concurrency: 4,
            max_retry_delay: Duration::from_secs(30),
            proxy_ban_threshold: 3,
            proxy_recovery_timeout: None,
            max_concurrent_jobs: 4,
            job_retention: Duration::from_secs(60 * 60),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_page_concurrency(mut self, page_concurrency: usize) -> Self {
        self.page_concurrency = page_concurrency.max(1);
        self
    }

    pub fn with_max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    pub fn with_proxy_ban_threshold(mut self, threshold: u32) -> Self {
        self.proxy_ban_threshold = threshold.max(1);
        self
    }

    pub fn with_proxy_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_recovery_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs.max(1);
        self
    }

    pub fn with_job_retention(mut self, job_retention: Duration) -> Self {
        self.job_retention = job_retention;
        self
    }

    fn proxy_pool(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            ban_threshold: self.proxy_ban_threshold,
            recovery_timeout: self.proxy_recovery_timeout,
        }
    }
}

/// Events emitted while a job runs, for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Started {
        job_id: Uuid,
        url: &'a str,
        pages: usize,
    },
    LoginAttempted {
        job_id: Uuid,
        url: &'a str,
        accepted: bool,
    },
    PageScraped {
        job_id: Uuid,
        page_index: usize,
        url: &'a str,
        records: usize,
    },
    PageFailed {
        job_id: Uuid,
        failure: &'a PageFailure,
    },
    Completed {
        job_id: Uuid,
        stats: &'a Stats,
    },
    Failed {
        job_id: Uuid,
        error: &'a str,
        cancelled: bool,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Started { job_id, url, pages } => {
                tracing::info!(%job_id, %url, pages, "Job started");
            }
            JobEvent::LoginAttempted {
                job_id,
                url,
                accepted,
            } => {
                if accepted {
                    tracing::info!(%job_id, %url, "Login accepted");
                } else {
                    tracing::warn!(%job_id, %url, "Login rejected, continuing without session");
                }
            }
            JobEvent::PageScraped {
                job_id,
                page_index,
                url,
                records,
            } => {
                tracing::info!(%job_id, page = page_index + 1, %url, records, "Page scraped");
            }
            JobEvent::PageFailed { job_id, failure } => {
                tracing::warn!(
                    %job_id,
                    page = failure.page_index + 1,
                    url = %failure.url,
                    attempts = failure.attempts,
                    status = ?failure.status,
                    error = %failure.error,
                    "Page failed"
                );
            }
            JobEvent::Completed { job_id, stats } => {
                tracing::info!(
                    %job_id,
                    successful_pages = stats.successful_pages,
                    failed_pages = stats.failed_pages,
                    items = stats.total_items,
                    duration_secs = stats.duration_secs().unwrap_or_default(),
                    "Job completed"
                );
            }
            JobEvent::Failed {
                job_id,
                error,
                cancelled,
            } => {
                tracing::warn!(%job_id, %error, cancelled, "Job failed");
            }
        }
    }
}

/// Composes fetching, extraction, pagination and dedup into one job run.
#[derive(Clone)]
pub struct JobOrchestrator<FF, Q, H>
where
    FF: FetcherFactory,
    Q: StructuredQuery,
    H: HistorySink,
{
    factory: FF,
    query: Q,
    history: H,
    dedup: Arc<DedupStore>,
    config: OrchestratorConfig,
}

/// What stopped the page loop early.
enum Halt {
    Cancelled,
    Unreachable(AppError),
}

impl<FF, Q, H> JobOrchestrator<FF, Q, H>
where
    FF: FetcherFactory,
    Q: StructuredQuery,
    H: HistorySink,
{
    pub fn new(
        factory: FF,
        query: Q,
        history: H,
        dedup: Arc<DedupStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            factory,
            query,
            history,
            dedup,
            config,
        }
    }

    pub fn factory(&self) -> &FF {
        &self.factory
    }

    pub fn query(&self) -> &Q {
        &self.query
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run the job whose state lives in `state` to completion.
    ///
    /// Returns the terminal snapshot. If the job is no longer `queued`
    /// (for example it was cancelled before starting) nothing runs.
    pub async fn run<R: JobReporter>(
        &self,
        config: &ScrapeConfig,
        state: &watch::Sender<JobState>,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> JobSnapshot {
        let job_id = state.borrow().id;

        let mut started = Ok(());
        state.send_modify(|s| started = s.transition(JobStatus::Running));
        if let Err(e) = started {
            tracing::debug!(%job_id, error = %e, "Job not runnable");
            return state.borrow().snapshot();
        }

        let pool = Arc::new(ProxyPool::new(
            config.active_proxies().iter().cloned(),
            self.config.proxy_pool(),
        ));
        let outcome = self.scrape(job_id, config, state, &pool, cancel, reporter).await;
        self.finish(job_id, config, state, &pool, outcome, reporter)
            .await
    }

    /// Fail a job that was cancelled while still queued. It is reported and
    /// recorded like any other finished job. Does nothing if the job has
    /// already left `queued`.
    pub async fn abandon<R: JobReporter>(
        &self,
        state: &watch::Sender<JobState>,
        reporter: &R,
    ) -> JobSnapshot {
        let job_id = state.borrow().id;
        let mut finished = state.borrow().clone();
        if finished.status != JobStatus::Queued || finished.fail(&AppError::Cancelled).is_err() {
            return state.borrow().snapshot();
        }

        let snapshot = finished.snapshot();
        reporter.report(JobEvent::Failed {
            job_id,
            error: &AppError::Cancelled.to_string(),
            cancelled: true,
        });
        self.record_history(&snapshot).await;

        state.send_replace(finished);
        snapshot
    }

    async fn scrape<R: JobReporter>(
        &self,
        job_id: Uuid,
        config: &ScrapeConfig,
        state: &watch::Sender<JobState>,
        pool: &Arc<ProxyPool>,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        config.validate()?;
        let pages = pagination::pages(&config.url, config.pagination.as_ref())?;
        let total = pages.len();
        state.send_modify(|s| {
            s.stats.total_pages = total;
            s.progress.pages_total = total;
        });
        reporter.report(JobEvent::Started {
            job_id,
            url: &config.url,
            pages: total,
        });

        let limiter = Arc::new(RateLimiter::new(config.max_requests_per_second)?);
        let inner = self.factory.create(config).await?;
        let fetcher = JobFetcher::new(
            inner,
            limiter,
            Arc::clone(pool),
            RetryPolicy::for_config(config, self.config.max_retry_delay),
        );

        if let Some(login) = config.login_request() {
            let proxy = pool.next().ok().flatten();
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                result = fetcher.inner().login(&login, proxy.as_ref()) => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(%job_id, url = %login.url, error = %e, "Login request failed");
                        false
                    }
                },
            };
            reporter.report(JobEvent::LoginAttempted {
                job_id,
                url: &login.url,
                accepted,
            });
        }

        let image_dir = config.image_dir();
        let worker = fetcher.clone();
        let token = cancel.clone();
        let mut fetches = futures::stream::iter(pages.enumerate())
            .map(move |(index, url)| {
                let worker = worker.clone();
                let token = token.clone();
                async move {
                    let outcome = worker.fetch(&url, &token).await;
                    (index, url, outcome)
                }
            })
            .buffered(self.config.page_concurrency.max(1));

        let mut halt = None;
        while let Some((index, url, outcome)) = fetches.next().await {
            if cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
                break;
            }
            state.send_modify(|s| s.progress.current_url = Some(url.clone()));

            let RetryOutcome { result, attempts } = outcome;
            let page = match result {
                Ok(page) => page,
                Err(AppError::Cancelled) => {
                    halt = Some(Halt::Cancelled);
                    break;
                }
                Err(e) if index == 0 && e.is_unreachable() => {
                    self.page_failed(job_id, state, index, &url, attempts, &e, reporter);
                    halt = Some(Halt::Unreachable(e));
                    break;
                }
                Err(e) => {
                    self.page_failed(job_id, state, index, &url, attempts, &e, reporter);
                    continue;
                }
            };

            let extraction = match self.extract_page(&page, config) {
                Ok(extraction) => extraction,
                Err(e) => {
                    self.page_failed(job_id, state, index, &url, attempts, &e, reporter);
                    continue;
                }
            };

            let downloaded = match &image_dir {
                Some(dir) => download_images(&fetcher, &extraction.images, dir, cancel).await,
                None => 0,
            };
            self.aggregate(job_id, state, index, &url, extraction, downloaded, config, reporter);
        }
        drop(fetches);

        match halt {
            Some(Halt::Cancelled) => Err(AppError::Cancelled),
            Some(Halt::Unreachable(e)) => Err(e),
            None if cancel.is_cancelled() => Err(AppError::Cancelled),
            None => Ok(()),
        }
    }

    /// Parse and extract synchronously; the parsed document never lives
    /// across an await point.
    fn extract_page(
        &self,
        page: &FetchedPage,
        config: &ScrapeConfig,
    ) -> Result<PageExtraction, AppError> {
        let document = self.query.parse(&page.body);
        extract::extract(&document, &page.url, config)
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate<R: JobReporter>(
        &self,
        job_id: Uuid,
        state: &watch::Sender<JobState>,
        index: usize,
        url: &str,
        extraction: PageExtraction,
        downloaded: usize,
        config: &ScrapeConfig,
        reporter: &R,
    ) {
        let found = extraction.records.len();
        let records: Vec<_> = if config.incremental_scraping {
            extraction
                .records
                .into_iter()
                .filter(|record| self.dedup.insert_if_new(record.fingerprint()))
                .collect()
        } else {
            extraction.records
        };
        let kept = records.len();

        state.send_modify(|s| {
            s.stats.successful_pages += 1;
            s.stats.total_items += kept;
            s.stats.skipped_items += extraction.skipped_items;
            s.stats.duplicate_items += found - kept;
            s.stats.images_found += extraction.images.len();
            s.stats.images_downloaded += downloaded;
            s.records.extend(records);
            s.progress.pages_done += 1;
        });

        reporter.report(JobEvent::PageScraped {
            job_id,
            page_index: index,
            url,
            records: kept,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn page_failed<R: JobReporter>(
        &self,
        job_id: Uuid,
        state: &watch::Sender<JobState>,
        index: usize,
        url: &str,
        attempts: u32,
        error: &AppError,
        reporter: &R,
    ) {
        let failure = PageFailure {
            page_index: index,
            url: url.to_string(),
            attempts,
            status: error.status(),
            error: error.to_string(),
        };
        reporter.report(JobEvent::PageFailed {
            job_id,
            failure: &failure,
        });
        state.send_modify(|s| {
            s.stats.failed_pages += 1;
            s.stats.failures.push(failure);
            s.progress.pages_done += 1;
        });
    }

    async fn finish<R: JobReporter>(
        &self,
        job_id: Uuid,
        config: &ScrapeConfig,
        state: &watch::Sender<JobState>,
        pool: &ProxyPool,
        outcome: Result<(), AppError>,
        reporter: &R,
    ) -> JobSnapshot {
        // The terminal state is built off to the side and published last, so
        // anyone woken by it sees history and dedup already written.
        let mut finished = state.borrow().clone();
        finished.proxies = pool.snapshot();
        finished.progress.current_url = None;
        let transition = match &outcome {
            Ok(()) => finished.transition(JobStatus::Completed),
            Err(e) => finished.fail(e),
        };
        if let Err(e) = transition {
            tracing::error!(%job_id, error = %e, "Failed to finalize job state");
        }

        if config.incremental_scraping
            && let Err(e) = self.dedup.persist().await
        {
            tracing::warn!(%job_id, error = %e, "Failed to persist dedup store");
        }

        let snapshot = finished.snapshot();
        match &outcome {
            Ok(()) => reporter.report(JobEvent::Completed {
                job_id,
                stats: &snapshot.stats,
            }),
            Err(e) => reporter.report(JobEvent::Failed {
                job_id,
                error: &e.to_string(),
                cancelled: matches!(e, AppError::Cancelled),
            }),
        }

        self.record_history(&snapshot).await;

        state.send_replace(finished);
        snapshot
    }

    async fn record_history(&self, snapshot: &JobSnapshot) {
        let entry = HistoryEntry {
            job_id: snapshot.id,
            url: snapshot.url.clone(),
            result_count: snapshot.stats.total_items,
            images_count: snapshot.stats.images_found,
            status: snapshot.status,
            error_message: snapshot.error.clone(),
            duration_secs: snapshot.stats.duration_secs().unwrap_or_default(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.history.record(&entry).await {
            tracing::warn!(job_id = %snapshot.id, error = %e, "Failed to record job history");
        }
    }
}

/// Fetch each image through the job's paced path and write it under `dir`.
/// Returns how many were written.
async fn download_images<F: PageFetcher>(
    fetcher: &JobFetcher<F>,
    images: &[String],
    dir: &Path,
    cancel: &CancellationToken,
) -> usize {
    if images.is_empty() {
        return 0;
    }
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Cannot create image directory");
        return 0;
    }

    let mut written = 0;
    for url in images {
        let bytes = match fetcher.fetch_bytes(url, cancel).await.result {
            Ok(bytes) => bytes,
            Err(AppError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(%url, error = %e, "Image download failed");
                continue;
            }
        };
        let path = dir.join(image_file_name(url));
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => written += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cannot write image"),
        }
    }
    written
}

/// `<hash prefix>_<last path segment>`, safe for any filesystem.
fn image_file_name(url: &str) -> String {
    let last = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());
    let safe: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect();
    format!("{}_{}", &compute_hash(url)[..12], safe)
}
