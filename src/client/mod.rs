//! Client side of the resumable upload protocol.
//!
//! [`driver::UploadDriver`] pushes an [`source::UploadSource`] to a
//! server through a [`transport::Transport`], remembering enough in a
//! [`state::ResumeState`] file to pick up where it left off after a crash.

use std::path::PathBuf;

use axum::http::StatusCode;
use thiserror::Error;

pub mod driver;
pub mod source;
pub mod state;
pub mod transport;

pub use driver::{DriverOptions, UploadDriver, UploadReport};
pub use source::{FileSource, UploadSource};
pub use state::ResumeState;
pub use transport::{Exchange, HttpTransport, LocalTransport, ReplyFuture, ServerReply, Transport};

/// Errors surfaced by the upload driver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request could not be delivered or its response not received.
    /// The resume state is kept, so a later run can continue.
    #[error("transport failure: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// Reading the local source failed.
    #[error("failed to read upload source: {0}")]
    Source(#[from] std::io::Error),

    /// The resume state file could not be read or written.
    #[error("resume state at {}: {source:#}", path.display())]
    State {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The server answered with something the protocol does not allow.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// The server refused the request.
    #[error("server answered {status}: {}", body.trim_end())]
    Rejected { status: StatusCode, body: String },

    /// Offset conflicts kept recurring past the configured limit.
    #[error("gave up after {attempts} offset conflicts")]
    ConflictRetriesExhausted { attempts: u32 },

    /// There is no upload to act on.
    #[error("no upload recorded in the resume state")]
    NoUpload,
}
