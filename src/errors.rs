//! Upload error taxonomy.
//!
//! Every variant maps to one HTTP status.  Variants that know the
//! authoritative upload state carry it, so the response can still tell
//! the client where the upload really stands.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::protocol::{ProtocolVersion, UploadState};

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors returned by the upload engine.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No upload with this identifier exists.
    #[error("upload not found")]
    NotFound { id: String },

    /// `Upload-Offset` was missing or not a non-negative integer.
    #[error("invalid or missing Upload-Offset header")]
    InvalidOffset,

    /// The client's offset disagrees with the server's.
    #[error("mismatching Upload-Offset value")]
    OffsetConflict {
        client_offset: u64,
        state: UploadState,
    },

    /// The upload no longer accepts bytes.
    #[error("upload is already complete")]
    AlreadyComplete { state: UploadState },

    /// Reading the request body failed part-way.
    #[error("upload interrupted: {source}")]
    Interrupted {
        state: Option<UploadState>,
        #[source]
        source: std::io::Error,
    },

    /// The storage layer failed; the text is passed through verbatim.
    #[error("{0}")]
    StorageFailure(#[from] anyhow::Error),
}

impl UploadError {
    /// Short machine-friendly name, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::NotFound { .. } => "not_found",
            UploadError::InvalidOffset => "invalid_offset",
            UploadError::OffsetConflict { .. } => "offset_conflict",
            UploadError::AlreadyComplete { .. } => "already_complete",
            UploadError::Interrupted { .. } => "interrupted",
            UploadError::StorageFailure(_) => "storage_failure",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::NotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::InvalidOffset => StatusCode::BAD_REQUEST,
            UploadError::OffsetConflict { .. } => StatusCode::CONFLICT,
            UploadError::AlreadyComplete { .. } => StatusCode::BAD_REQUEST,
            UploadError::Interrupted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Authoritative upload state, when the error knows it.
    pub fn state(&self) -> Option<UploadState> {
        match self {
            UploadError::OffsetConflict { state, .. } => Some(*state),
            UploadError::AlreadyComplete { state } => Some(*state),
            UploadError::Interrupted { state, .. } => *state,
            _ => None,
        }
    }

    /// Render the error for a peer speaking `version`.
    pub fn into_response_for(self, version: ProtocolVersion) -> Response {
        let mut headers = HeaderMap::new();
        version.set_interop(&mut headers);
        if let Some(state) = self.state() {
            version.set_state(&mut headers, state);
        }
        let body = format!("{self}\n");
        (
            self.status_code(),
            headers,
            [("content-type", "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

/// An error paired with the protocol version the request arrived in.
#[derive(Debug)]
pub struct VersionedError(pub ProtocolVersion, pub UploadError);

impl IntoResponse for VersionedError {
    fn into_response(self) -> Response {
        self.1.into_response_for(self.0)
    }
}
