use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gleaner_core::extract::SelectorPreview;
use gleaner_core::job::{Progress, Stats};
use gleaner_core::{
    ExtractedRecord, HistoryEntry, JobSnapshot, ProxyRecord, ScrapeConfig, SelectorLanguage,
    UrlCheck,
};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    /// Job configuration: `url`, `selectors` or `itemScraping`, pacing,
    /// pagination, proxies, credentials and image options (camelCase keys).
    #[schema(value_type = Object)]
    pub config: ScrapeConfig,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: Uuid,
    pub url: String,
    pub status: String,
    #[schema(value_type = Object)]
    pub progress: Progress,
    #[schema(value_type = Object)]
    pub stats: Stats,
    /// Present once the job is completed or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Vec<Object>>)]
    pub records: Option<Vec<ExtractedRecord>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub proxies: Vec<ProxyRecord>,
    pub error: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<JobSnapshot> for JobResponse {
    fn from(job: JobSnapshot) -> Self {
        Self {
            id: job.id,
            url: job.url,
            status: job.status.to_string(),
            progress: job.progress,
            stats: job.stats,
            records: job.records,
            proxies: job.proxies,
            error: job.error,
            cancelled: job.cancelled,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Selectors & URLs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TestSelectorRequest {
    pub url: String,
    pub selector: String,
    /// `css` (default) or `xpath`
    #[serde(rename = "type", default)]
    #[schema(value_type = String)]
    pub language: SelectorLanguage,
    /// Attribute to read instead of text (CSS only)
    pub attribute: Option<String>,
    /// Render the page with a headless browser first
    #[serde(default)]
    pub render: bool,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectorPreviewResponse {
    pub match_count: usize,
    pub preview_values: Vec<String>,
}

impl From<SelectorPreview> for SelectorPreviewResponse {
    fn from(p: SelectorPreview) -> Self {
        Self {
            match_count: p.match_count,
            preview_values: p.preview_values,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ValidateUrlRequest {
    pub url: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UrlCheckResponse {
    pub accessible: bool,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<UrlCheck> for UrlCheckResponse {
    fn from(c: UrlCheck) -> Self {
        Self {
            accessible: c.accessible,
            status_code: c.status_code,
            content_type: c.content_type,
            final_url: c.final_url,
            error: c.error,
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    pub job_id: Uuid,
    pub url: String,
    pub result_count: usize,
    pub images_count: usize,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<HistoryEntry> for HistoryEntryResponse {
    fn from(e: HistoryEntry) -> Self {
        Self {
            job_id: e.job_id,
            url: e.url,
            result_count: e.result_count,
            images_count: e.images_count,
            status: e.status.to_string(),
            error_message: e.error_message,
            duration_secs: e.duration_secs,
            timestamp: e.timestamp,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HistoryListResponse {
    pub entries: Vec<HistoryEntryResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ClearDedupResponse {
    /// Number of fingerprints forgotten
    pub cleared: usize,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
