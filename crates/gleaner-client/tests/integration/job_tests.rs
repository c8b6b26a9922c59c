use std::time::Duration;

use gleaner_core::testutil::MockHistory;
use gleaner_core::{
    FieldSelector, JobStatus, PaginationConfig, ScrapeConfig, Selector,
};

use crate::integration::common::{closed_port_url, manager, serve_catalogue};

fn catalogue_config(base: &str) -> ScrapeConfig {
    ScrapeConfig::new(format!("{base}/catalogue/"))
        .with_items(
            Selector::css("article.product_pod"),
            vec![
                FieldSelector::new("title", Selector::css("h3 a").with_attribute("title")),
                FieldSelector::new("price", Selector::css("p.price")).required(),
            ],
        )
        .with_pagination(PaginationConfig::query("page", 1, 3))
        .with_rate(50.0)
        .with_retries(1, Duration::from_millis(10))
}

#[tokio::test]
async fn test_paginated_job_over_http() {
    let server = serve_catalogue().await;
    let history = MockHistory::new();
    let manager = manager(history.clone());

    let id = manager.submit(catalogue_config(&server.uri())).unwrap();
    let done = manager.wait(id).await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.stats.total_pages, 3);
    assert_eq!(done.stats.successful_pages, 2);
    assert_eq!(done.stats.failed_pages, 1);
    assert_eq!(done.stats.failures[0].status, Some(404));
    assert_eq!(done.stats.total_items, 4);
    assert_eq!(done.stats.skipped_items, 2);

    let records = done.records.unwrap();
    let titles: Vec<String> = records
        .iter()
        .map(|r| r.fields["title"].join(""))
        .collect();
    assert_eq!(titles, vec!["Book 1", "Book 3", "Book 7", "Book 9"]);
    assert!(records[0].url.ends_with("/catalogue/?page=1"));
    assert!(records[3].url.ends_with("/catalogue/?page=3"));

    let entries = history.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, id);
    assert_eq!(entries[0].result_count, 4);
}

#[tokio::test]
async fn test_incremental_rerun_skips_seen_records() {
    let server = serve_catalogue().await;
    let manager = manager(MockHistory::new());
    let config = catalogue_config(&server.uri()).with_incremental(true);

    let first = manager.submit(config.clone()).unwrap();
    let first = manager.wait(first).await.unwrap();
    assert_eq!(first.stats.total_items, 4);

    let second = manager.submit(config).unwrap();
    let second = manager.wait(second).await.unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.stats.total_items, 0);
    assert_eq!(second.stats.duplicate_items, 4);
    assert_eq!(second.records.unwrap().len(), 0);
}

#[tokio::test]
async fn test_unreachable_first_page_fails_job() {
    let manager = manager(MockHistory::new());
    let config = ScrapeConfig::new(closed_port_url())
        .with_field(FieldSelector::new("title", Selector::css("title")))
        .with_retries(0, Duration::ZERO);

    let id = manager.submit(config).unwrap();
    let done = manager.wait(id).await.unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.is_some());
    assert!(!done.cancelled);
}

#[tokio::test]
async fn test_selector_preview_over_http() {
    let server = serve_catalogue().await;
    let manager = manager(MockHistory::new());

    let shown = manager
        .test_selector(
            &format!("{}/catalogue/?page=3", server.uri()),
            Selector::css("h3 a").with_attribute("title"),
            false,
        )
        .await
        .unwrap();

    assert_eq!(shown.match_count, 3);
    assert_eq!(shown.preview_values[0], "Book 7");
}
