use chrono::{DateTime, Utc};
use gleaner_core::error::AppError;
use gleaner_core::job::JobStatus;
use gleaner_core::traits::{HistoryEntry, HistorySink};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Append-only log of finished scrape jobs.
#[derive(Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one finished job. A job id can only be recorded once.
    pub async fn insert(&self, entry: &HistoryEntry) -> Result<(), AppError> {
        if !entry.status.is_terminal() {
            return Err(AppError::ValidationError(format!(
                "cannot record job {} in state '{}'",
                entry.job_id, entry.status
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO scrape_history
                (job_id, url, result_count, images_count, status, error_message, duration_secs, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.job_id.to_string())
        .bind(&entry.url)
        .bind(entry.result_count as i64)
        .bind(entry.images_count as i64)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(entry.duration_secs)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(job_id = %entry.job_id, status = %entry.status, "History entry recorded");
        Ok(())
    }

    /// Entries newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>, AppError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT job_id, url, result_count, images_count, status, error_message, duration_secs, timestamp
            FROM scrape_history
            ORDER BY timestamp DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(HistoryEntry::try_from).collect()
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<HistoryEntry>, AppError> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT job_id, url, result_count, images_count, status, error_message, duration_secs, timestamp
            FROM scrape_history
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(HistoryEntry::try_from).transpose()
    }

    pub async fn count(&self) -> Result<usize, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scrape_history")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(count.max(0) as usize)
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct HistoryRow {
    job_id: String,
    url: String,
    result_count: i64,
    images_count: i64,
    status: String,
    error_message: Option<String>,
    duration_secs: f64,
    timestamp: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = AppError;

    fn try_from(row: HistoryRow) -> Result<Self, AppError> {
        let job_id = Uuid::parse_str(&row.job_id)
            .map_err(|e| AppError::DatabaseError(format!("corrupt job id '{}': {e}", row.job_id)))?;
        let status: JobStatus = row.status.parse().map_err(AppError::DatabaseError)?;
        Ok(HistoryEntry {
            job_id,
            url: row.url,
            result_count: row.result_count.max(0) as usize,
            images_count: row.images_count.max(0) as usize,
            status,
            error_message: row.error_message,
            duration_secs: row.duration_secs,
            timestamp: row.timestamp,
        })
    }
}

// -- Trait implementation --

impl HistorySink for HistoryRepository {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), AppError> {
        self.insert(entry).await
    }
}
