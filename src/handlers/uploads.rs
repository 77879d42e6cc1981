//! Upload endpoint handlers.
//!
//! Each handler detects the protocol version of the request, translates
//! its headers into an engine call, and renders the outcome in the same
//! version.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::engine::{BodyStream, CreateRequest, Provisional, UploadOutcome};
use crate::errors::UploadError;
use crate::metrics::record_operation;
use crate::protocol::{idempotency_key, parse_offset, ProtocolVersion, PROVISIONAL_STATUS};
use crate::AppState;

/// Adapt an axum request body into the engine's byte stream.
fn body_stream(body: Body) -> BodyStream {
    Box::pin(body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other)))
}

fn request_version(state: &AppState, headers: &HeaderMap) -> ProtocolVersion {
    ProtocolVersion::detect(headers, state.config.protocol.default_version)
}

/// Render an engine result for a peer speaking `version`.
pub(crate) fn respond(
    operation: &'static str,
    version: ProtocolVersion,
    result: Result<UploadOutcome, UploadError>,
) -> Response {
    match result {
        Ok(outcome) => {
            record_operation(operation, outcome.status);
            let mut headers = HeaderMap::new();
            version.set_interop(&mut headers);
            version.set_state(&mut headers, outcome.state);
            if let Some(location) = outcome.location {
                match HeaderValue::from_str(&location) {
                    Ok(value) => {
                        headers.insert(header::LOCATION, value);
                    }
                    Err(_) => error!(location = %location, "Upload location is not a valid header value"),
                }
            }
            (outcome.status, headers).into_response()
        }
        Err(err) => failure(operation, version, err),
    }
}

pub(crate) fn failure(operation: &'static str, version: ProtocolVersion, err: UploadError) -> Response {
    let status = err.status_code();
    record_operation(operation, status);
    if status.is_server_error() {
        error!(operation, error = %err, "Upload operation failed");
    } else {
        debug!(operation, code = err.code(), "Upload operation rejected");
    }
    err.into_response_for(version)
}

/// Wait for the engine's provisional announcement.
///
/// hyper offers no way to write an interim 1xx response from a handler,
/// so the announcement is logged and its location carried over to the
/// final response instead.
async fn observe_provisional(rx: oneshot::Receiver<Provisional>) -> Option<Provisional> {
    let provisional = rx.await.ok()?;
    debug!(
        status = PROVISIONAL_STATUS,
        location = %provisional.location,
        offset = ?provisional.offset,
        version = %provisional.version,
        "Upload location known before body"
    );
    Some(provisional)
}

/// `POST /` -- Create an upload (or resume one through its idempotency key).
#[utoipa::path(
    post,
    path = "/",
    tag = "Upload",
    operation_id = "CreateUpload",
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Token deduplicating retried creations"),
        ("Upload-Incomplete" = Option<String>, Header, description = "`?1` when more bytes will follow (drafts up to 3)"),
        ("Upload-Complete" = Option<String>, Header, description = "`?0` when more bytes will follow (draft 4)"),
        ("Upload-Draft-Interop-Version" = Option<String>, Header, description = "Protocol draft of the client"),
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Upload created or resumed; Location and Upload-Offset set"),
        (status = 200, description = "Idempotent retry of a completed upload; body ignored"),
        (status = 409, description = "Retried body shorter than the stored prefix; Location set"),
        (status = 500, description = "Storage failure or interrupted body; Location set once the upload exists")
    )
)]
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let version = request_version(&state, &headers);
    let request = CreateRequest {
        idempotency_key: idempotency_key(&headers),
        complete: version.declares_complete(&headers),
        version,
    };

    let (tx, rx) = oneshot::channel();
    let (result, announced) = tokio::join!(
        state.engine.create(request, body_stream(body), Some(tx)),
        observe_provisional(rx)
    );
    let mut response = respond("create", version, result);
    // A create that fails after the upload was minted still tells the
    // client where to resume.
    if let Some(provisional) = announced {
        if !response.headers().contains_key(header::LOCATION) {
            if let Ok(value) = HeaderValue::from_str(&provisional.location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
        }
    }
    response
}

/// `PATCH /uploads/{id}` -- Append bytes at the current offset.
#[utoipa::path(
    patch,
    path = "/uploads/{id}",
    tag = "Upload",
    operation_id = "AppendUpload",
    params(
        ("id" = String, Path, description = "Upload identifier"),
        ("Upload-Offset" = u64, Header, description = "Offset the client believes the upload is at"),
        ("Upload-Incomplete" = Option<String>, Header, description = "`?1` when more bytes will follow (drafts up to 3)"),
        ("Upload-Complete" = Option<String>, Header, description = "`?0` when more bytes will follow (draft 4)"),
    ),
    request_body(content = Vec<u8>, content_type = "application/offset+octet-stream"),
    responses(
        (status = 200, description = "Bytes appended; Upload-Offset is the new offset"),
        (status = 400, description = "Missing or malformed Upload-Offset, or upload already complete"),
        (status = 404, description = "Upload not found"),
        (status = 409, description = "Offset mismatch; Upload-Offset is the server's offset"),
        (status = 500, description = "Storage failure or interrupted body")
    )
)]
pub async fn append_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let version = request_version(&state, &headers);
    let offset = parse_offset(&headers);
    let complete = version.declares_complete(&headers);
    let result = state
        .engine
        .append(&id, offset, complete, body_stream(body))
        .await;
    respond("append", version, result)
}

/// `HEAD /uploads/{id}` -- Report the current offset.
#[utoipa::path(
    head,
    path = "/uploads/{id}",
    tag = "Upload",
    operation_id = "QueryUploadOffset",
    params(("id" = String, Path, description = "Upload identifier")),
    responses(
        (status = 200, description = "Upload-Offset and completion header set"),
        (status = 404, description = "Upload not found")
    )
)]
pub async fn query_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let version = request_version(&state, &headers);
    let result = state
        .engine
        .query_offset(&id)
        .await
        .map(|upload| UploadOutcome {
            status: StatusCode::OK,
            location: None,
            state: upload,
        });
    let mut response = respond("query", version, result);
    if response.status().is_success() {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}

/// `DELETE /uploads/{id}` -- Cancel an upload and drop its bytes.
#[utoipa::path(
    delete,
    path = "/uploads/{id}",
    tag = "Upload",
    operation_id = "CancelUpload",
    params(("id" = String, Path, description = "Upload identifier")),
    responses(
        (status = 204, description = "Upload deleted"),
        (status = 404, description = "Upload not found")
    )
)]
pub async fn cancel_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let version = request_version(&state, &headers);
    match state.engine.cancel(&id).await {
        Ok(()) => {
            record_operation("cancel", StatusCode::NO_CONTENT);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => failure("cancel", version, err),
    }
}
