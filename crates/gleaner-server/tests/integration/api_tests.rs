use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use crate::integration::common::{
    PRODUCT_PAGE, body_json, get_request, json_request, serve_page, setup_test_app,
};

fn job_body(url: &str) -> serde_json::Value {
    json!({
        "config": {
            "url": url,
            "selectors": [
                {"name": "title", "selector": "h1"},
                {"name": "products", "selector": "//li[@class='product']/a", "type": "xpath"}
            ],
            "maxRequestsPerSecond": 50.0,
            "maxRetries": 0
        }
    })
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn openapi_document_is_public() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::get("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["paths"]["/v1/jobs"].is_object());
    assert!(json["paths"]["/v1/selectors/test"].is_object());
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/v1/jobs").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::get("/v1/jobs")
                .header("authorization", "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn invalid_config_returns_400() {
    let app = setup_test_app().await;
    let body = json!({"config": {"url": "https://shop.example/", "selectors": []}});

    let response = app
        .router
        .oneshot(json_request("POST", "/v1/jobs", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "validation_error");
    assert!(app.state.manager.list().is_empty());
}

#[tokio::test]
async fn create_and_poll_job() {
    let app = setup_test_app().await;
    let server = serve_page(PRODUCT_PAGE, Duration::ZERO).await;
    let url = format!("{}/shop", server.uri());

    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/v1/jobs", &job_body(&url)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    let job_id: Uuid = json["jobId"].as_str().unwrap().parse().unwrap();

    app.state.manager.wait(job_id).await.unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get_request(&format!("/v1/jobs/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = body_json(response).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["stats"]["successfulPages"], 1);
    assert_eq!(job["records"][0]["fields"]["title"], "Hello");
    assert_eq!(
        job["records"][0]["fields"]["products"],
        json!(["Lamp", "Desk"])
    );

    let response = app
        .router
        .clone()
        .oneshot(get_request("/v1/history"))
        .await
        .unwrap();
    let history = body_json(response).await;
    assert_eq!(history["total"], 1);
    assert_eq!(history["entries"][0]["jobId"], job_id.to_string());
    assert_eq!(history["entries"][0]["resultCount"], 1);

    let response = app
        .router
        .oneshot(get_request(&format!("/v1/history/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_job_returns_404() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(get_request(&format!("/v1/jobs/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"], "not_found");

    let response = app
        .router
        .oneshot(get_request(&format!("/v1/history/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_running_job() {
    let app = setup_test_app().await;
    let server = serve_page(PRODUCT_PAGE, Duration::from_secs(3)).await;
    let url = format!("{}/shop", server.uri());

    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/v1/jobs", &job_body(&url)))
        .await
        .unwrap();
    let job_id: Uuid = body_json(response).await["jobId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "DELETE",
            &format!("/v1/jobs/{job_id}"),
            &json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let done = app.state.manager.wait(job_id).await.unwrap();
    assert!(done.cancelled);

    // Cancelling again hits a finished job.
    let response = app
        .router
        .oneshot(json_request(
            "DELETE",
            &format!("/v1/jobs/{job_id}"),
            &json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn list_jobs_with_status_filter() {
    let app = setup_test_app().await;
    let server = serve_page(PRODUCT_PAGE, Duration::ZERO).await;
    let url = format!("{}/shop", server.uri());

    let id = app
        .state
        .manager
        .submit(serde_json::from_value(job_body(&url)["config"].clone()).unwrap())
        .unwrap();
    app.state.manager.wait(id).await.unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get_request("/v1/jobs?status=completed"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["total"], 1);
    assert!(json["jobs"][0].get("records").is_none());

    let response = app
        .router
        .clone()
        .oneshot(get_request("/v1/jobs?status=running"))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["total"], 0);

    let response = app
        .router
        .oneshot(get_request("/v1/jobs?status=paused"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn selector_test_endpoint() {
    let app = setup_test_app().await;
    let server = serve_page(PRODUCT_PAGE, Duration::ZERO).await;
    let url = format!("{}/shop", server.uri());

    let body = json!({"url": url, "selector": "li.product a", "attribute": "href"});
    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/v1/selectors/test", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["matchCount"], 2);
    assert_eq!(json["previewValues"][0], format!("{}/p/1", server.uri()));

    let body = json!({"url": url, "selector": "//li[", "type": "xpath"});
    let response = app
        .router
        .oneshot(json_request("POST", "/v1/selectors/test", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn validate_url_endpoint() {
    let app = setup_test_app().await;
    let server = serve_page(PRODUCT_PAGE, Duration::ZERO).await;

    let body = json!({"url": format!("{}/shop", server.uri())});
    let response = app
        .router
        .clone()
        .oneshot(json_request("POST", "/v1/urls/validate", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["accessible"], true);
    assert_eq!(json["statusCode"], 200);

    let body = json!({"url": "ftp://files.example/"});
    let response = app
        .router
        .oneshot(json_request("POST", "/v1/urls/validate", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn clear_dedup_endpoint() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(json_request("DELETE", "/v1/dedup", &json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["cleared"], 0);
}
