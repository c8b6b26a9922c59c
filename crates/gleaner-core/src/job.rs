use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ExtractedRecord;
use crate::proxy_pool::ProxyRecord;

/// Lifecycle of a scrape job: `queued -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Live progress of a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub pages_done: usize,
    pub pages_total: usize,
    pub current_url: Option<String>,
}

/// A page that could not be fetched or extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFailure {
    pub page_index: usize,
    pub url: String,
    pub attempts: u32,
    pub status: Option<u16>,
    pub error: String,
}

/// Cumulative statistics for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_pages: usize,
    pub successful_pages: usize,
    pub failed_pages: usize,
    /// Records kept after deduplication.
    pub total_items: usize,
    /// Items dropped for a missing required field.
    pub skipped_items: usize,
    /// Records dropped as already seen (incremental mode).
    pub duplicate_items: usize,
    pub images_found: usize,
    pub images_downloaded: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PageFailure>,
}

impl Stats {
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Full mutable state of one job, owned by its orchestrator run.
#[derive(Debug, Clone)]
pub struct JobState {
    pub id: Uuid,
    pub url: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub stats: Stats,
    pub records: Vec<ExtractedRecord>,
    pub proxies: Vec<ProxyRecord>,
    pub error: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(id: Uuid, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            status: JobStatus::Queued,
            progress: Progress::default(),
            stats: Stats::default(),
            records: Vec::new(),
            proxies: Vec::new(),
            error: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    /// Move forward in the lifecycle; backwards moves and re-entry are rejected.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            JobStatus::Running => self.stats.start_time = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => self.stats.end_time = Some(Utc::now()),
            JobStatus::Queued => {}
        }
        self.status = next;
        Ok(())
    }

    /// Terminal failure with a reason.
    pub fn fail(&mut self, error: &AppError) -> Result<(), AppError> {
        self.transition(JobStatus::Failed)?;
        self.cancelled = matches!(error, AppError::Cancelled);
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Pollable view; records are included once the job is terminal.
    pub fn snapshot(&self) -> JobSnapshot {
        let terminal = self.status.is_terminal();
        JobSnapshot {
            id: self.id,
            url: self.url.clone(),
            status: self.status,
            progress: self.progress.clone(),
            stats: self.stats.clone(),
            records: terminal.then(|| self.records.clone()),
            proxies: self.proxies.clone(),
            error: self.error.clone(),
            cancelled: self.cancelled,
            created_at: self.created_at,
        }
    }
}

/// Result of a `status` poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: Uuid,
    pub url: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub stats: Stats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<ExtractedRecord>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<ProxyRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}
