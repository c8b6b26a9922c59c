use std::time::Duration;

use gleaner_client::{ClientFetcherFactory, HtmlQuery, HttpFetcher};
use gleaner_core::testutil::MockHistory;
use gleaner_core::{DedupStore, JobOrchestrator, OrchestratorConfig, ScrapeManager};
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub type TestManager = ScrapeManager<ClientFetcherFactory, HtmlQuery, MockHistory>;

/// A catalogue listing in the shape most shop pages use.
pub fn catalogue_page(page: u32) -> String {
    let mut items = String::new();
    for n in 1..=3 {
        let id = (page - 1) * 3 + n;
        // The second product on every page has no price.
        let price = if n == 2 {
            String::new()
        } else {
            format!(r#"<p class="price">£{id}.00</p>"#)
        };
        items.push_str(&format!(
            r#"
            <article class="product_pod">
              <div class="image_container">
                <a href="../item/{id}/index.html"><img data-src="/media/{id}.jpg" alt="Book {id}"></a>
              </div>
              <h3><a href="../item/{id}/index.html" title="Book {id}">Book   {id}</a></h3>
              {price}
            </article>"#
        ));
    }
    format!(
        r#"<!DOCTYPE html>
        <html><head><title>All products | Page {page}</title></head>
        <body>
          <h1>All products</h1>
          <section><ol class="row">{items}</ol></section>
        </body></html>"#
    )
}

/// Serve `/catalogue/?page=1..=3`, with page 2 answering 404.
pub async fn serve_catalogue() -> MockServer {
    let server = MockServer::start().await;
    for page in [1, 3] {
        Mock::given(method("GET"))
            .and(path("/catalogue/"))
            .and(query_param("page", page.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(catalogue_page(page)),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/catalogue/"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    server
}

pub fn manager(history: MockHistory) -> TestManager {
    let http = HttpFetcher::with_timeout(Duration::from_secs(5)).allow_private_urls();
    ScrapeManager::new(JobOrchestrator::new(
        ClientFetcherFactory::new(http),
        HtmlQuery,
        history,
        Arc::new(DedupStore::new()),
        OrchestratorConfig::default(),
    ))
}

/// A local URL nothing listens on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/")
}
