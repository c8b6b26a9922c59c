use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::JobStatus;
use crate::models::{LoginRequest, ScrapeConfig, Selector};
use crate::proxy_pool::ProxyEndpoint;

/// A successfully retrieved document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL after redirects.
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Result of a lightweight reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCheck {
    pub accessible: bool,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub final_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Retrieves documents over plain HTTP or through a rendering browser.
///
/// Implementations classify failures into [`AppError::TransientFetch`] and
/// [`AppError::FatalFetch`]; retries, pacing and proxy selection happen
/// outside, in [`crate::fetcher::JobFetcher`].
pub trait PageFetcher: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> impl Future<Output = Result<FetchedPage, AppError>> + Send;

    /// Download a binary asset such as an image.
    fn fetch_bytes(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;

    /// Perform a HEAD-style reachability check.
    fn probe(&self, url: &str) -> impl Future<Output = Result<UrlCheck, AppError>> + Send;

    /// Submit a login form; returns whether the server accepted it.
    fn login(
        &self,
        request: &LoginRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Builds the fetch strategy for a job (plain HTTP or rendering).
pub trait FetcherFactory: Send + Sync + Clone + 'static {
    type Fetcher: PageFetcher;

    fn create(
        &self,
        config: &ScrapeConfig,
    ) -> impl Future<Output = Result<Self::Fetcher, AppError>> + Send;
}

/// One node matched by a selector, reduced to owned values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMatch {
    /// Text content, or the string value for attribute/text/scalar results.
    pub text: String,
    /// Attributes of element matches.
    pub attributes: BTreeMap<String, String>,
}

impl NodeMatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A parsed document that can evaluate CSS and XPath selectors.
pub trait QueryDocument {
    /// A container node usable as the scope of further queries.
    type Scope<'a>: Copy
    where
        Self: 'a;

    /// Evaluate a container selector from the document root, in document order.
    fn scopes(&self, selector: &Selector) -> Result<Vec<Self::Scope<'_>>, AppError>;

    /// Evaluate a selector against the whole document or within `scope`.
    fn select<'a>(
        &'a self,
        scope: Option<Self::Scope<'a>>,
        selector: &Selector,
    ) -> Result<Vec<NodeMatch>, AppError>;
}

/// Parses fetched documents into queryable trees.
pub trait StructuredQuery: Send + Sync + Clone + 'static {
    type Document: QueryDocument;

    fn parse(&self, html: &str) -> Self::Document;
}

/// One finished job, as written to the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub job_id: Uuid,
    pub url: String,
    pub result_count: usize,
    pub images_count: usize,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of finished jobs.
pub trait HistorySink: Send + Sync + Clone + 'static {
    fn record(&self, entry: &HistoryEntry) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op HistorySink for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHistory;

impl HistorySink for NullHistory {
    async fn record(&self, _entry: &HistoryEntry) -> Result<(), AppError> {
        Ok(())
    }
}

/// An optional sink: `None` records nothing.
impl<H: HistorySink> HistorySink for Option<H> {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), AppError> {
        match self {
            Some(sink) => sink.record(entry).await,
            None => Ok(()),
        }
    }
}
