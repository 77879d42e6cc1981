//! Axum router construction and upload route mapping.
//!
//! The [`app`] function wires the four upload endpoints plus the health,
//! metrics and OpenAPI endpoints to their handlers and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::generate_request_id;
use crate::handlers::uploads;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::protocol::{INTEROP_VERSION, UPLOAD_COMPLETE, UPLOAD_INCOMPLETE, UPLOAD_OFFSET};
use crate::AppState;

/// Value of the `Server` response header.
const SERVER_NAME: &str = "resumable-upload";

// -- OpenAPI document ---------------------------------------------------------

/// OpenAPI documentation for the resumable upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Resumable Upload API",
        version = "0.1.0",
        description = "Chunked, resumable HTTP uploads"
    ),
    paths(
        health_check,
        crate::handlers::uploads::create_upload,
        crate::handlers::uploads::append_upload,
        crate::handlers::uploads::query_upload,
        crate::handlers::uploads::cancel_upload,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Resumable upload operations"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all upload routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/openapi.json", get(openapi_json))
        .route("/", post(uploads::create_upload))
        .route(
            "/uploads/:id",
            patch(uploads::append_upload)
                .head(uploads::query_upload)
                .delete(uploads::cancel_upload),
        );
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        // metrics_middleware wraps the handlers and the layers above (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // Upload bodies are streamed to storage and may be arbitrarily large.
        .layer(DefaultBodyLimit::disable())
}

/// Permissive CORS that lets browser clients read the protocol headers.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::LOCATION,
            HeaderName::from_static(UPLOAD_OFFSET),
            HeaderName::from_static(UPLOAD_INCOMPLETE),
            HeaderName::from_static(UPLOAD_COMPLETE),
            HeaderName::from_static(INTEROP_VERSION),
        ])
}

// -- Common headers middleware -----------------------------------------------

/// Middleware that adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: crate name
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert(header::DATE, value);
    }
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- The OpenAPI document for this server.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
