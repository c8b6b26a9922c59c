use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

use gleaner_client::HttpFetcher;
use gleaner_core::{DedupStore, OrchestratorConfig};
use gleaner_db::Database;
use gleaner_server::routes;
use gleaner_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

pub const PRODUCT_PAGE: &str = r#"<html><head><title>Shop</title></head>
<body>
  <h1>Hello</h1>
  <ul>
    <li class="product"><a href="/p/1">Lamp</a></li>
    <li class="product"><a href="/p/2">Desk</a></li>
  </ul>
</body></html>"#;

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

/// App backed by a migrated in-memory SQLite database. The fetcher may reach
/// loopback so tests can point jobs at a local mock server.
pub async fn setup_test_app() -> TestApp {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");

    let state = Arc::new(AppState::new(
        db,
        TEST_API_KEY,
        HttpFetcher::with_timeout(Duration::from_secs(5)).allow_private_urls(),
        Arc::new(DedupStore::new()),
        OrchestratorConfig::default(),
    ));

    TestApp {
        router: routes::router(state.clone()),
        state,
    }
}

/// Serve `body` at `/shop` for any method, optionally after `delay`.
pub async fn serve_page(body: &str, delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/shop"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(body)
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

pub fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {TEST_API_KEY}"))
}

pub fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
    authed(Request::builder().method(method).uri(uri))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    authed(Request::get(uri)).body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}
