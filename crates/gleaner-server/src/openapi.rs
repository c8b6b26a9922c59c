use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Gleaner API",
        version = "0.1.0",
        description = "Declarative CSS/XPath scraping jobs with pacing, retries, proxy rotation and pagination."
    ),
    paths(
        crate::routes::create_job,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::cancel_job,
        crate::routes::test_selector,
        crate::routes::validate_url,
        crate::routes::list_history,
        crate::routes::get_history,
        crate::routes::clear_dedup,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::CreateJobRequest,
        crate::dto::CreateJobResponse,
        crate::dto::JobResponse,
        crate::dto::JobListResponse,
        crate::dto::TestSelectorRequest,
        crate::dto::SelectorPreviewResponse,
        crate::dto::ValidateUrlRequest,
        crate::dto::UrlCheckResponse,
        crate::dto::HistoryEntryResponse,
        crate::dto::HistoryListResponse,
        crate::dto::ClearDedupResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Scrape job submission, polling and cancellation"),
        (name = "selectors", description = "Interactive selector and URL checks"),
        (name = "history", description = "Finished jobs and incremental-scrape state"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds the Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "API key. Set via GLEANER_SERVER_API_KEY environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
