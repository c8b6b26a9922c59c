use gleaner_core::AppError;
use gleaner_core::job::JobStatus;
use gleaner_core::traits::HistorySink;
use uuid::Uuid;

use crate::integration::common::{completed_entry, setup_test_db};

#[tokio::test]
async fn test_record_and_get() {
    let repo = setup_test_db().await.history_repo();
    let mut entry = completed_entry("https://books.example/catalogue/", 40, 0);
    entry.images_count = 12;

    repo.record(&entry).await.unwrap();

    let stored = repo.get(entry.job_id).await.unwrap().unwrap();
    assert_eq!(stored, entry);
    assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_job_keeps_error_message() {
    let repo = setup_test_db().await.history_repo();
    let mut entry = completed_entry("https://down.example/", 0, 0);
    entry.status = JobStatus::Failed;
    entry.error_message = Some("Job cancelled".into());

    repo.record(&entry).await.unwrap();

    let stored = repo.get(entry.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("Job cancelled"));
}

#[tokio::test]
async fn test_list_newest_first_with_paging() {
    let repo = setup_test_db().await.history_repo();
    for minutes in 0..5 {
        let entry = completed_entry(&format!("https://shop.example/{minutes}"), 1, minutes);
        repo.record(&entry).await.unwrap();
    }

    assert_eq!(repo.count().await.unwrap(), 5);

    let first = repo.list(2, 0).await.unwrap();
    let urls: Vec<&str> = first.iter().map(|e| e.url.as_str()).collect();
    assert_eq!(urls, vec!["https://shop.example/4", "https://shop.example/3"]);

    let rest = repo.list(10, 2).await.unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[2].url, "https://shop.example/0");
}

#[tokio::test]
async fn test_job_recorded_once() {
    let repo = setup_test_db().await.history_repo();
    let entry = completed_entry("https://books.example/", 3, 0);

    repo.record(&entry).await.unwrap();
    let again = repo.record(&entry).await;

    assert!(matches!(again, Err(AppError::DatabaseError(_))));
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_running_job_rejected() {
    let repo = setup_test_db().await.history_repo();
    let mut entry = completed_entry("https://books.example/", 0, 0);
    entry.status = JobStatus::Running;

    let result = repo.record(&entry).await;

    assert!(matches!(result, Err(AppError::ValidationError(_))));
    assert_eq!(repo.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_health_check() {
    let db = setup_test_db().await;
    db.history_repo().health_check().await.unwrap();
}
