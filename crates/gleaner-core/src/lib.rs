pub mod dedup;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod pagination;
pub mod proxy_pool;
pub mod rate_limiter;
pub mod retry;
pub mod service;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use dedup::DedupStore;
pub use error::AppError;
pub use extract::{PageExtraction, SelectorPreview};
pub use job::{JobSnapshot, JobState, JobStatus, Progress, Stats};
pub use models::{
    Credential, DedupKey, ExtractedRecord, FieldSelector, FieldValue, ItemScraping,
    PaginationConfig, PaginationStyle, ScrapeConfig, Selector, SelectorLanguage, compute_hash,
};
pub use orchestrator::{
    JobEvent, JobOrchestrator, JobReporter, OrchestratorConfig, TracingJobReporter,
};
pub use proxy_pool::{ProxyEndpoint, ProxyHealth, ProxyPool, ProxyPoolConfig, ProxyRecord};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use service::ScrapeManager;
pub use traits::{
    FetchedPage, FetcherFactory, HistoryEntry, HistorySink, NodeMatch, NullHistory, PageFetcher,
    QueryDocument, StructuredQuery, UrlCheck,
};
