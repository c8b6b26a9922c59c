use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use gleaner_core::error::AppError;
use gleaner_core::{JobStatus, Selector};

use crate::auth::require_api_key;
use crate::dto::{
    ClearDedupResponse, CreateJobRequest, CreateJobResponse, ErrorResponse, HealthResponse,
    HistoryEntryResponse, HistoryListResponse, HistoryQuery, JobListResponse, JobResponse,
    ListJobsQuery, SelectorPreviewResponse, TestSelectorRequest, UrlCheckResponse,
    ValidateUrlRequest,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}", delete(cancel_job))
        .route("/v1/selectors/test", post(test_selector))
        .route("/v1/urls/validate", post(validate_url))
        .route("/v1/history", get(list_history))
        .route("/v1/history/{id}", get(get_history))
        .route("/v1/dedup", delete(clear_dedup))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

fn not_found(message: String) -> axum::response::Response {
    let body = ErrorResponse {
        error: "not_found".to_string(),
        message,
    };
    (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job queued", body = CreateJobResponse),
        (status = 400, description = "Invalid configuration", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.manager.submit(body.config)?;
    let status = state.manager.status(job_id)?.status;

    let response = CreateJobResponse {
        job_id,
        status: status.to_string(),
    };

    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Known jobs, oldest first", body = JobListResponse),
        (status = 400, description = "Unknown status filter", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status_filter: Option<JobStatus> = query
        .status
        .map(|s| s.parse().map_err(AppError::ValidationError))
        .transpose()?;

    let jobs: Vec<JobResponse> = state
        .manager
        .list()
        .into_iter()
        .filter(|job| status_filter.is_none_or(|status| job.status == status))
        .map(|mut job| {
            // Listings stay small; records are fetched per job.
            job.records = None;
            JobResponse::from(job)
        })
        .collect();
    let total = jobs.len();

    Ok(axum::Json(JobListResponse { jobs, total }))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job snapshot; records once terminal", body = JobResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.manager.status(id)?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 204, description = "Cancellation requested"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Job already finished", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.manager.status(id)?;
    if job.status.is_terminal() {
        let body = ErrorResponse {
            error: "conflict".to_string(),
            message: format!("Job {id} is already in terminal state: {}", job.status),
        };
        return Ok((StatusCode::CONFLICT, axum::Json(body)).into_response());
    }

    state.manager.cancel(id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// Selectors & URLs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/selectors/test",
    request_body = TestSelectorRequest,
    responses(
        (status = 200, description = "Match count and the first values", body = SelectorPreviewResponse),
        (status = 400, description = "Invalid selector or URL", body = ErrorResponse),
        (status = 502, description = "Page could not be fetched", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "selectors"
)]
pub async fn test_selector(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<TestSelectorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let selector = Selector {
        expression: body.selector,
        language: body.language,
        attribute: body.attribute,
    };
    let preview = state
        .manager
        .test_selector(&body.url, selector, body.render)
        .await?;
    Ok(axum::Json(SelectorPreviewResponse::from(preview)))
}

#[utoipa::path(
    post,
    path = "/v1/urls/validate",
    request_body = ValidateUrlRequest,
    responses(
        (status = 200, description = "Reachability report", body = UrlCheckResponse),
        (status = 400, description = "Malformed URL", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "selectors"
)]
pub async fn validate_url(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<ValidateUrlRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let check = state.manager.validate_url(&body.url).await?;
    Ok(axum::Json(UrlCheckResponse::from(check)))
}

// ---------------------------------------------------------------------------
// History & dedup
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/history",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Finished jobs, newest first", body = HistoryListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "history"
)]
pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = state.db.history_repo();
    let limit = query.limit.unwrap_or(20).min(100);
    let offset = query.offset.unwrap_or(0);

    let entries = repo.list(limit, offset).await?;
    let total = repo.count().await?;

    Ok(axum::Json(HistoryListResponse {
        entries: entries
            .into_iter()
            .map(HistoryEntryResponse::from)
            .collect(),
        total,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/history/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "History entry", body = HistoryEntryResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "history"
)]
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.history_repo().get(id).await? {
        Some(entry) => Ok(axum::Json(HistoryEntryResponse::from(entry)).into_response()),
        None => Ok(not_found(format!("No history for job {id}"))),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/dedup",
    responses(
        (status = 200, description = "Fingerprints cleared", body = ClearDedupResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "history"
)]
pub async fn clear_dedup(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let cleared = state.manager.clear_dedup().await?;
    Ok(axum::Json(ClearDedupResponse { cleared }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = state.db.history_repo().health_check().await.is_ok();

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if db_ok { "healthy" } else { "unhealthy" },
        database: if db_ok { "ok" } else { "error" },
    };

    (status, axum::Json(response))
}
