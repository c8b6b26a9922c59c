//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::models::{LoginRequest, ScrapeConfig, Selector};
use crate::orchestrator::{JobEvent, JobReporter};
use crate::proxy_pool::ProxyEndpoint;
use crate::traits::{
    FetchedPage, FetcherFactory, HistoryEntry, HistorySink, NodeMatch, PageFetcher, QueryDocument,
    StructuredQuery, UrlCheck,
};

// ---------------------------------------------------------------------------
// MockPageFetcher
// ---------------------------------------------------------------------------

/// Scripted response for one fetch of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// 200 with this body.
    Page(String),
    /// A non-success HTTP status, classified like a real fetcher would.
    Status(u16),
    /// No response at all (connection refused, timeout).
    Unreachable,
    /// The host does not resolve.
    Dns,
}

impl MockResponse {
    pub fn page(body: impl Into<String>) -> Self {
        MockResponse::Page(body.into())
    }

    fn into_result(self, url: &str) -> Result<String, AppError> {
        match self {
            MockResponse::Page(body) => Ok(body),
            MockResponse::Status(status) => Err(AppError::from_status(url, status)),
            MockResponse::Unreachable => Err(AppError::TransientFetch {
                url: url.to_string(),
                status: None,
                message: "connection refused".into(),
            }),
            MockResponse::Dns => Err(AppError::FatalFetch {
                url: url.to_string(),
                status: None,
                message: "failed to resolve host".into(),
            }),
        }
    }
}

/// One recorded call to the mock fetcher.
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub url: String,
    pub proxy: Option<String>,
    pub at: Instant,
}

/// Mock fetcher with per-URL scripted responses.
///
/// Each URL has a queue; the last entry repeats once the queue is down to
/// one. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockPageFetcher {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    assets: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
    logins: Arc<Mutex<Vec<LoginRequest>>>,
    login_accepted: Arc<Mutex<bool>>,
    latency: Arc<Mutex<Duration>>,
}

impl MockPageFetcher {
    pub fn new() -> Self {
        Self {
            login_accepted: Arc::new(Mutex::new(true)),
            ..Default::default()
        }
    }

    pub fn with_page(self, url: &str, body: &str) -> Self {
        self.with_sequence(url, vec![MockResponse::page(body)])
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.with_sequence(url, vec![MockResponse::Status(status)])
    }

    pub fn with_sequence(self, url: &str, responses: Vec<MockResponse>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
        self
    }

    pub fn with_asset(self, url: &str, bytes: &[u8]) -> Self {
        self.assets
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = latency;
        self
    }

    pub fn rejecting_login(self) -> Self {
        *self.login_accepted.lock().unwrap() = false;
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    pub fn logins(&self) -> Vec<LoginRequest> {
        self.logins.lock().unwrap().clone()
    }

    fn next_response(&self, url: &str) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(MockResponse::Status(404)),
            None => MockResponse::Status(404),
        }
    }

    fn record(&self, url: &str, proxy: Option<&ProxyEndpoint>) {
        self.calls.lock().unwrap().push(FetchCall {
            url: url.to_string(),
            proxy: proxy.map(|p| p.address().to_string()),
            at: Instant::now(),
        });
    }
}

impl PageFetcher for MockPageFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchedPage, AppError> {
        self.record(url, proxy);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let body = self.next_response(url).into_result(url)?;
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
        self.record(url, proxy);
        let asset = self.assets.lock().unwrap().get(url).cloned();
        asset.ok_or_else(|| AppError::from_status(url, 404))
    }

    async fn probe(&self, url: &str) -> Result<UrlCheck, AppError> {
        let known = self.responses.lock().unwrap().contains_key(url);
        Ok(UrlCheck {
            accessible: known,
            status_code: Some(if known { 200 } else { 404 }),
            content_type: known.then(|| "text/html".to_string()),
            final_url: Some(url.to_string()),
            error: None,
        })
    }

    async fn login(
        &self,
        request: &LoginRequest,
        _proxy: Option<&ProxyEndpoint>,
    ) -> Result<bool, AppError> {
        self.logins.lock().unwrap().push(request.clone());
        Ok(*self.login_accepted.lock().unwrap())
    }
}

// ---------------------------------------------------------------------------
// MockFetcherFactory
// ---------------------------------------------------------------------------

/// Factory that hands out clones of one [`MockPageFetcher`] and records
/// whether rendering was requested.
#[derive(Clone)]
pub struct MockFetcherFactory {
    pub fetcher: MockPageFetcher,
    pub render_requests: Arc<Mutex<Vec<bool>>>,
    create_error: Arc<Mutex<Option<AppError>>>,
}

impl MockFetcherFactory {
    pub fn new(fetcher: MockPageFetcher) -> Self {
        Self {
            fetcher,
            render_requests: Arc::new(Mutex::new(Vec::new())),
            create_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_create_error(error: AppError) -> Self {
        Self {
            fetcher: MockPageFetcher::new(),
            render_requests: Arc::new(Mutex::new(Vec::new())),
            create_error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl FetcherFactory for MockFetcherFactory {
    type Fetcher = MockPageFetcher;

    async fn create(&self, config: &ScrapeConfig) -> Result<MockPageFetcher, AppError> {
        if let Some(e) = self.create_error.lock().unwrap().take() {
            return Err(e);
        }
        self.render_requests
            .lock()
            .unwrap()
            .push(config.use_javascript_rendering);
        Ok(self.fetcher.clone())
    }
}

// ---------------------------------------------------------------------------
// MockQuery
// ---------------------------------------------------------------------------

/// Query capability over a tiny line-based document format.
///
/// ```text
/// title=Catalogue
/// item
///   name=Widget
///   link=More|href:/p/1
/// item
///   name=Gadget
/// ```
///
/// An unindented line without `=` opens a container block named by the
/// line; indented lines belong to the open block. A selector expression is
/// a key; `|attr:value` suffixes become attributes. Expressions starting
/// with `!` are rejected as invalid.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockQuery;

#[derive(Debug, Default)]
pub struct MockDocument {
    root: Vec<(String, NodeMatch)>,
    blocks: Vec<(String, Vec<(String, NodeMatch)>)>,
}

fn parse_entry(line: &str) -> Option<(String, NodeMatch)> {
    let (key, rest) = line.split_once('=')?;
    let mut parts = rest.split('|');
    let mut node = NodeMatch::text(parts.next().unwrap_or_default());
    for attr in parts {
        if let Some((name, value)) = attr.split_once(':') {
            node = node.with_attribute(name, value);
        }
    }
    Some((key.trim().to_string(), node))
}

fn check(selector: &Selector) -> Result<(), AppError> {
    if selector.expression.starts_with('!') {
        return Err(AppError::InvalidSelector {
            expression: selector.expression.clone(),
            message: "unexpected token '!'".into(),
        });
    }
    Ok(())
}

impl StructuredQuery for MockQuery {
    type Document = MockDocument;

    fn parse(&self, html: &str) -> MockDocument {
        let mut doc = MockDocument::default();
        for line in html.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let indented = line.starts_with(' ') || line.starts_with('\t');
            let line = line.trim();
            match (indented, parse_entry(line)) {
                (true, Some(entry)) => {
                    if let Some((_, fields)) = doc.blocks.last_mut() {
                        fields.push(entry.clone());
                    }
                    doc.root.push(entry);
                }
                (false, Some(entry)) => doc.root.push(entry),
                (_, None) => doc.blocks.push((line.to_string(), Vec::new())),
            }
        }
        doc
    }
}

impl QueryDocument for MockDocument {
    type Scope<'a>
        = usize
    where
        Self: 'a;

    fn scopes(&self, selector: &Selector) -> Result<Vec<usize>, AppError> {
        check(selector)?;
        Ok(self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| *name == selector.expression)
            .map(|(i, _)| i)
            .collect())
    }

    fn select<'a>(
        &'a self,
        scope: Option<usize>,
        selector: &Selector,
    ) -> Result<Vec<NodeMatch>, AppError> {
        check(selector)?;
        let entries = match scope {
            Some(i) => self.blocks.get(i).map(|(_, f)| f.as_slice()).unwrap_or(&[]),
            None => self.root.as_slice(),
        };
        Ok(entries
            .iter()
            .filter(|(key, _)| *key == selector.expression)
            .map(|(_, node)| node.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockHistory
// ---------------------------------------------------------------------------

/// History sink that records entries in memory.
#[derive(Clone, Default)]
pub struct MockHistory {
    pub entries: Arc<Mutex<Vec<HistoryEntry>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(Mutex::new(true)),
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl HistorySink for MockHistory {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), AppError> {
        if *self.fail.lock().unwrap() {
            return Err(AppError::DatabaseError("history unavailable".into()));
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock job reporter that records event labels.
#[derive(Default, Clone)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let label = match &event {
            JobEvent::Started { .. } => "Started",
            JobEvent::LoginAttempted { .. } => "LoginAttempted",
            JobEvent::PageScraped { .. } => "PageScraped",
            JobEvent::PageFailed { .. } => "PageFailed",
            JobEvent::Completed { .. } => "Completed",
            JobEvent::Failed { .. } => "Failed",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Build a page body in the [`MockQuery`] format from `(block, fields)` pairs.
pub fn item_page(items: &[&[(&str, &str)]]) -> String {
    let mut body = String::new();
    for fields in items {
        body.push_str("item\n");
        for (key, value) in *fields {
            body.push_str(&format!("  {key}={value}\n"));
        }
    }
    body
}

/// Build a field map of single values.
pub fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, crate::models::FieldValue> {
    pairs
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                crate::models::FieldValue::Single(v.to_string()),
            )
        })
        .collect()
}
