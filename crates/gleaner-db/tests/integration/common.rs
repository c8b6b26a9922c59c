use chrono::{DateTime, Duration, TimeZone, Utc};
use gleaner_core::job::JobStatus;
use gleaner_core::traits::HistoryEntry;
use gleaner_db::Database;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

/// A migrated in-memory database.
///
/// Every SQLite connection to `:memory:` opens its own database, so the pool
/// is pinned to a single connection.
pub async fn setup_test_db() -> Database {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    db
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// A completed entry finished `minutes` after a fixed base time.
pub fn completed_entry(url: &str, results: usize, minutes: i64) -> HistoryEntry {
    HistoryEntry {
        job_id: Uuid::new_v4(),
        url: url.to_string(),
        result_count: results,
        images_count: 0,
        status: JobStatus::Completed,
        error_message: None,
        duration_secs: 1.5,
        timestamp: base_time() + Duration::minutes(minutes),
    }
}
