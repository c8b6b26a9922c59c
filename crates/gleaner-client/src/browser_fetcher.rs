use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use gleaner_core::error::AppError;
use gleaner_core::models::LoginRequest;
use gleaner_core::proxy_pool::ProxyEndpoint;
use gleaner_core::traits::{FetchedPage, PageFetcher, UrlCheck};

use crate::fetcher::HttpFetcher;

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Pages are rendered, scripts included, before the DOM is returned. One
/// Chromium process is shared by all clones; each fetch opens a tab and
/// closes it afterwards. Binary downloads and reachability probes go over
/// plain HTTP. Chromium fixes its egress at launch, so per-request proxies
/// are not applied to rendered pages.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    http: HttpFetcher,
    timeout: Duration,
}

impl BrowserFetcher {
    /// Launch headless Chromium with a 30 s navigation timeout.
    pub async fn launch(http: HttpFetcher) -> Result<Self, AppError> {
        Self::launch_with_timeout(http, Duration::from_secs(30)).await
    }

    pub async fn launch_with_timeout(http: HttpFetcher, timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::ConfigError(format!("failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser handler stopped");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            http,
            timeout,
        })
    }

    async fn render(&self, url: &str) -> Result<String, AppError> {
        let transient = |message: String| AppError::TransientFetch {
            url: url.to_string(),
            status: None,
            message,
        };

        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| transient(format!("navigation failed: {e}")))?;
        page.find_element("body")
            .await
            .map_err(|e| transient(format!("page did not render a body: {e}")))?;
        let html = page
            .content()
            .await
            .map_err(|e| transient(format!("cannot read rendered content: {e}")));
        if let Err(e) = page.close().await {
            tracing::debug!(%url, error = %e, "Failed to close tab");
        }
        html
    }
}

/// Honours `CHROME_BIN`, then well-known install locations. Snap wrappers
/// reject headless flags, so the real binary inside the snap comes first.
fn chrome_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl PageFetcher for BrowserFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchedPage, AppError> {
        if let Some(proxy) = proxy {
            tracing::debug!(%url, %proxy, "Rendered fetch ignores per-request proxy");
        }
        let body = tokio::time::timeout(self.timeout, self.render(url))
            .await
            .map_err(|_| AppError::TransientFetch {
                url: url.to_string(),
                status: None,
                message: format!("render timed out after {}s", self.timeout.as_secs()),
            })??;
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            body,
        })
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Vec<u8>, AppError> {
        self.http.fetch_bytes(url, proxy).await
    }

    async fn probe(&self, url: &str) -> Result<UrlCheck, AppError> {
        self.http.probe(url).await
    }

    /// Fill and submit the login form inside the browser so the session
    /// cookies land in Chromium's own jar.
    async fn login(
        &self,
        request: &LoginRequest,
        _proxy: Option<&ProxyEndpoint>,
    ) -> Result<bool, AppError> {
        let failed = |message: String| AppError::TransientFetch {
            url: request.url.clone(),
            status: None,
            message,
        };
        let page = self
            .browser
            .new_page(request.url.as_str())
            .await
            .map_err(|e| failed(format!("navigation failed: {e}")))?;

        let fields = [
            (&request.username_field, &request.credential.username),
            (&request.password_field, &request.credential.password),
        ];
        for (name, value) in fields {
            let input = page
                .find_element(format!("input[name=\"{name}\"]"))
                .await
                .map_err(|e| failed(format!("login field '{name}' not found: {e}")))?;
            input
                .click()
                .await
                .map_err(|e| failed(e.to_string()))?
                .type_str(value)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        let submitted = page
            .find_element(format!("input[name=\"{}\"]", request.password_field))
            .await
            .map_err(|e| failed(e.to_string()))?
            .press_key("Enter")
            .await
            .is_ok();
        if submitted {
            let _ = page.wait_for_navigation().await;
        }
        if let Err(e) = page.close().await {
            tracing::debug!(url = %request.url, error = %e, "Failed to close tab");
        }
        Ok(submitted)
    }
}
