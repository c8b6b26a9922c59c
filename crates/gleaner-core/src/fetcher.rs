//! Polite fetching for one job.
//!
//! [`JobFetcher`] wraps a [`PageFetcher`] so that every attempt is
//! `acquire token -> pick proxy -> request -> report proxy outcome`, and
//! that unit is what the [`RetryPolicy`] repeats. Each retry therefore
//! waits for a fresh token and may go out through a different proxy.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::proxy_pool::{ProxyEndpoint, ProxyPool};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::traits::{FetchedPage, PageFetcher};

#[derive(Clone)]
pub struct JobFetcher<F> {
    inner: F,
    limiter: Arc<RateLimiter>,
    pool: Arc<ProxyPool>,
    retry: RetryPolicy,
}

impl<F: PageFetcher> JobFetcher<F> {
    pub fn new(
        inner: F,
        limiter: Arc<RateLimiter>,
        pool: Arc<ProxyPool>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner,
            limiter,
            pool,
            retry,
        }
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Fetch a page with pacing, proxy rotation and retries.
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> RetryOutcome<FetchedPage> {
        self.retry
            .execute(cancel, move |attempt| {
                self.attempt(url, attempt, cancel, move |proxy| async move {
                    self.inner.fetch(url, proxy.as_ref()).await
                })
            })
            .await
    }

    /// Download a binary asset through the same pacing and proxy path.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> RetryOutcome<Vec<u8>> {
        self.retry
            .execute(cancel, move |attempt| {
                self.attempt(url, attempt, cancel, move |proxy| async move {
                    self.inner.fetch_bytes(url, proxy.as_ref()).await
                })
            })
            .await
    }

    async fn attempt<T, R, Fut>(
        &self,
        url: &str,
        attempt: u32,
        cancel: &CancellationToken,
        request: R,
    ) -> Result<T, AppError>
    where
        R: FnOnce(Option<ProxyEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.limiter.acquire(cancel).await?;
        let proxy = self.pool.next()?;
        let used = proxy.clone();

        tracing::debug!(
            %url,
            attempt,
            proxy = used.as_ref().map(ProxyEndpoint::address).unwrap_or("direct"),
            "Fetching"
        );

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            result = request(proxy) => result,
        };

        if let Some(proxy) = &used {
            let failed = result
                .as_ref()
                .err()
                .is_some_and(AppError::implicates_proxy);
            self.pool.report_outcome(proxy, !failed);
        }

        result
    }
}
