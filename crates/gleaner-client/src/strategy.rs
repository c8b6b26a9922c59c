//! Fetch strategy selection: plain HTTP or a rendering browser, chosen
//! once per job.

#[cfg(feature = "browser")]
use std::sync::Arc;

use gleaner_core::error::AppError;
use gleaner_core::models::{LoginRequest, ScrapeConfig};
use gleaner_core::proxy_pool::ProxyEndpoint;
use gleaner_core::traits::{FetchedPage, FetcherFactory, PageFetcher, UrlCheck};
#[cfg(feature = "browser")]
use tokio::sync::OnceCell;

#[cfg(feature = "browser")]
use crate::browser_fetcher::BrowserFetcher;
use crate::fetcher::HttpFetcher;

/// The fetcher handed to a job.
#[derive(Clone)]
pub enum ClientFetcher {
    Http(HttpFetcher),
    #[cfg(feature = "browser")]
    Browser(BrowserFetcher),
}

impl PageFetcher for ClientFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchedPage, AppError> {
        match self {
            ClientFetcher::Http(f) => f.fetch(url, proxy).await,
            #[cfg(feature = "browser")]
            ClientFetcher::Browser(f) => f.fetch(url, proxy).await,
        }
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Vec<u8>, AppError> {
        match self {
            ClientFetcher::Http(f) => f.fetch_bytes(url, proxy).await,
            #[cfg(feature = "browser")]
            ClientFetcher::Browser(f) => f.fetch_bytes(url, proxy).await,
        }
    }

    async fn probe(&self, url: &str) -> Result<UrlCheck, AppError> {
        match self {
            ClientFetcher::Http(f) => f.probe(url).await,
            #[cfg(feature = "browser")]
            ClientFetcher::Browser(f) => f.probe(url).await,
        }
    }

    async fn login(
        &self,
        request: &LoginRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<bool, AppError> {
        match self {
            ClientFetcher::Http(f) => f.login(request, proxy).await,
            #[cfg(feature = "browser")]
            ClientFetcher::Browser(f) => f.login(request, proxy).await,
        }
    }
}

/// Builds a [`ClientFetcher`] per job.
///
/// Every job gets its own HTTP session (cookie jar and client cache). The
/// browser, when enabled, is launched on first use and shared.
#[derive(Clone)]
pub struct ClientFetcherFactory {
    http: HttpFetcher,
    #[cfg(feature = "browser")]
    browser: Arc<OnceCell<BrowserFetcher>>,
}

impl ClientFetcherFactory {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            #[cfg(feature = "browser")]
            browser: Arc::new(OnceCell::new()),
        }
    }
}

impl Default for ClientFetcherFactory {
    fn default() -> Self {
        Self::new(HttpFetcher::new())
    }
}

impl FetcherFactory for ClientFetcherFactory {
    type Fetcher = ClientFetcher;

    async fn create(&self, config: &ScrapeConfig) -> Result<ClientFetcher, AppError> {
        let session = self.http.new_session();
        if !config.use_javascript_rendering {
            return Ok(ClientFetcher::Http(session));
        }

        #[cfg(feature = "browser")]
        {
            let browser = self
                .browser
                .get_or_try_init(|| BrowserFetcher::launch(session.clone()))
                .await?;
            tracing::debug!(engine = ?config.js_engine, "Using rendering fetcher");
            Ok(ClientFetcher::Browser(browser.clone()))
        }

        #[cfg(not(feature = "browser"))]
        {
            tracing::warn!(
                url = %config.url,
                "JavaScript rendering requested but the browser feature is not enabled; using plain HTTP"
            );
            Ok(ClientFetcher::Http(session))
        }
    }
}
