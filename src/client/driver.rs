//! Resumable upload driver.
//!
//! Without a recorded location the driver creates the upload, sending the
//! whole source and declaring it complete.  With one, it asks the server
//! for its offset and appends only the rest.  Every location it learns is
//! written to the resume state before the next protocol step, and nothing
//! short of an explicit cancel throws that state away, so a crash at any
//! point can be resumed instead of restarted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::source::UploadSource;
use super::state::ResumeState;
use super::transport::{Exchange, ServerReply, Transport};
use super::ClientError;
use crate::engine::Provisional;
use crate::protocol::{ProtocolVersion, UploadState, IDEMPOTENCY_KEY, UPLOAD_OFFSET};

/// Caller policy for one driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Protocol draft to speak.
    pub version: ProtocolVersion,
    /// How many offset conflicts to absorb before giving up.  `None`
    /// retries for as long as the server keeps answering.
    pub max_conflict_retries: Option<u32>,
    /// Delete the resume state once the server confirms completion.
    pub clear_state_on_complete: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::Draft4,
            max_conflict_retries: None,
            clear_state_on_complete: false,
        }
    }
}

/// Final result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub location: String,
    pub state: UploadState,
    /// Status of the last response.
    pub status: StatusCode,
    /// Body of the last response, verbatim.
    pub body: Bytes,
}

/// What one create or append attempt led to.
enum Step {
    Finished(UploadReport),
    /// The server's offset moved under us; query and try again.
    Conflict,
    /// The recorded upload is gone; start over with a fresh create.
    Gone,
}

pub struct UploadDriver {
    transport: Arc<dyn Transport>,
    state_path: PathBuf,
    options: DriverOptions,
}

impl UploadDriver {
    pub fn new(
        transport: Arc<dyn Transport>,
        state_path: impl Into<PathBuf>,
        options: DriverOptions,
    ) -> Self {
        Self {
            transport,
            state_path: state_path.into(),
            options,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Upload `source`, resuming from the recorded state if there is one.
    pub async fn upload(&self, source: &dyn UploadSource) -> Result<UploadReport, ClientError> {
        let mut state = self.load_state()?;
        let mut conflicts = 0u32;

        loop {
            let step = match state.location.clone() {
                None => self.create(&mut state, source).await?,
                Some(location) => self.resume(&location, source).await?,
            };
            match step {
                Step::Finished(report) => {
                    if report.state.complete && self.options.clear_state_on_complete {
                        ResumeState::clear(&self.state_path).map_err(|e| self.state_error(e))?;
                        debug!(path = %self.state_path.display(), "Resume state cleared");
                    }
                    return Ok(report);
                }
                Step::Conflict => {
                    if let Some(max) = self.options.max_conflict_retries {
                        if conflicts >= max {
                            return Err(ClientError::ConflictRetriesExhausted {
                                attempts: conflicts,
                            });
                        }
                    }
                    conflicts += 1;
                    info!(attempt = conflicts, "Offset conflict, re-querying the server");
                }
                Step::Gone => {
                    warn!("Recorded upload no longer exists, starting a new one");
                    state = ResumeState::default();
                    self.save_state(&state)?;
                }
            }
        }
    }

    /// Cancel the recorded upload and forget it.
    pub async fn cancel(&self) -> Result<(), ClientError> {
        let state = self.load_state()?;
        let location = state.location.ok_or(ClientError::NoUpload)?;

        let reply = self
            .transport
            .cancel(&location, self.base_headers())
            .await
            .map_err(ClientError::Transport)?;
        match reply.status {
            status if status.is_success() => info!(location = %location, "Upload cancelled"),
            StatusCode::NOT_FOUND => warn!(location = %location, "Upload was already gone"),
            status => {
                return Err(ClientError::Rejected {
                    status,
                    body: reply.text(),
                })
            }
        }
        ResumeState::clear(&self.state_path).map_err(|e| self.state_error(e))
    }

    // -- Protocol steps ------------------------------------------------------

    async fn create(
        &self,
        state: &mut ResumeState,
        source: &dyn UploadSource,
    ) -> Result<Step, ClientError> {
        // Persist the key first: if the connection drops before any location
        // is learned, a retried create with the same key still finds the upload.
        let key = match &state.idempotency_key {
            Some(key) => key.clone(),
            None => {
                let key = Uuid::new_v4().to_string();
                state.idempotency_key = Some(key.clone());
                self.save_state(state)?;
                key
            }
        };

        let mut headers = self.base_headers();
        self.options.version.set_completion(&mut headers, true);
        headers.insert(IDEMPOTENCY_KEY, header_value(&key)?);

        let body = source.stream_from(0).await?;
        info!(bytes = source.len(), "Creating upload");
        let Exchange {
            mut provisional,
            response,
        } = self.transport.create(headers, body);
        tokio::pin!(response);

        let mut provisional_seen = false;
        let reply = loop {
            tokio::select! {
                biased;
                announced = &mut provisional, if !provisional_seen => {
                    provisional_seen = true;
                    if let Ok(announced) = announced {
                        self.on_provisional(state, announced)?;
                    }
                }
                reply = &mut response => break reply,
            }
        };
        // The announcement may have been sent in the same poll that finished
        // the response.
        if !provisional_seen {
            if let Ok(announced) = provisional.try_recv() {
                self.on_provisional(state, announced)?;
            }
        }
        let reply = reply.map_err(ClientError::Transport)?;
        if !reply.status.is_success() {
            // Failed creates still name the upload once it exists.
            if let Some(location) = location_header(&reply.headers) {
                self.remember_location(state, &location)?;
            }
        }

        match reply.status {
            status if status.is_success() => {
                let location = match location_header(&reply.headers) {
                    Some(location) => location,
                    None => state.location.clone().ok_or_else(|| ClientError::Protocol {
                        message: "creation response carries no Location".to_string(),
                    })?,
                };
                self.remember_location(state, &location)?;
                let upload = self.read_upload_state(&reply)?;
                self.check_complete_length(upload, source.len())?;
                info!(location = %location, offset = upload.offset, complete = upload.complete, "Upload created");
                Ok(Step::Finished(UploadReport {
                    location,
                    state: upload,
                    status: reply.status,
                    body: reply.body,
                }))
            }
            StatusCode::CONFLICT => {
                // The key points at an upload holding more than we just sent.
                // Retrying the same body can never succeed.
                let server = self.read_upload_state(&reply)?;
                if server.offset > source.len() {
                    return Err(ClientError::Protocol {
                        message: format!(
                            "server holds {} bytes but the source only has {}",
                            server.offset,
                            source.len()
                        ),
                    });
                }
                Ok(Step::Conflict)
            }
            status => Err(ClientError::Rejected {
                status,
                body: reply.text(),
            }),
        }
    }

    async fn resume(&self, location: &str, source: &dyn UploadSource) -> Result<Step, ClientError> {
        let reply = self
            .transport
            .query(location, self.base_headers())
            .await
            .map_err(ClientError::Transport)?;
        match reply.status {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Ok(Step::Gone),
            status => {
                return Err(ClientError::Rejected {
                    status,
                    body: reply.text(),
                })
            }
        }
        let server = self.read_upload_state(&reply)?;
        let total = source.len();
        info!(location = %location, offset = server.offset, total, "Server reported upload offset");

        if server.complete {
            self.check_complete_length(server, total)?;
            info!(location = %location, "Upload is already complete");
            return Ok(Step::Finished(UploadReport {
                location: location.to_string(),
                state: server,
                status: reply.status,
                body: reply.body,
            }));
        }
        if server.offset > total {
            return Err(ClientError::Protocol {
                message: format!(
                    "server holds {} bytes but the source only has {total}",
                    server.offset
                ),
            });
        }

        let mut headers = self.base_headers();
        self.options.version.set_completion(&mut headers, true);
        headers.insert(UPLOAD_OFFSET, HeaderValue::from(server.offset));
        let body = source.stream_from(server.offset).await?;

        let reply = self
            .transport
            .append(location, headers, body)
            .await
            .map_err(ClientError::Transport)?;
        match reply.status {
            status if status.is_success() => {
                let upload = self.read_upload_state(&reply)?;
                self.check_complete_length(upload, total)?;
                info!(location = %location, offset = upload.offset, complete = upload.complete, "Upload resumed");
                Ok(Step::Finished(UploadReport {
                    location: location.to_string(),
                    state: upload,
                    status: reply.status,
                    body: reply.body,
                }))
            }
            StatusCode::CONFLICT => Ok(Step::Conflict),
            StatusCode::NOT_FOUND => Ok(Step::Gone),
            status => Err(ClientError::Rejected {
                status,
                body: reply.text(),
            }),
        }
    }

    /// Record the location from a provisional announcement, unless it was
    /// sent in a protocol version other than ours.
    fn on_provisional(
        &self,
        state: &mut ResumeState,
        provisional: Provisional,
    ) -> Result<(), ClientError> {
        if provisional.version != self.options.version {
            warn!(
                expected = %self.options.version,
                received = %provisional.version,
                "Ignoring provisional response with mismatching interop version"
            );
            return Ok(());
        }
        if let Some(offset) = provisional.offset {
            info!(offset, "Server already holds part of this upload");
        }
        info!(location = %provisional.location, "Provisional response received");
        self.remember_location(state, &provisional.location)
    }

    fn remember_location(&self, state: &mut ResumeState, location: &str) -> Result<(), ClientError> {
        if state.location.as_deref() == Some(location) {
            return Ok(());
        }
        state.location = Some(location.to_string());
        self.save_state(state)
    }

    // -- Helpers -------------------------------------------------------------

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.options.version.set_interop(&mut headers);
        headers
    }

    /// Read the state a server reported, in the version it answered with.
    fn read_upload_state(&self, reply: &ServerReply) -> Result<UploadState, ClientError> {
        let version = ProtocolVersion::of_response(&reply.headers);
        if version != self.options.version {
            warn!(
                expected = %self.options.version,
                received = %version,
                "Server answered in a different protocol version"
            );
        }
        version
            .read_state(&reply.headers)
            .ok_or_else(|| ClientError::Protocol {
                message: format!("{} response carries no valid Upload-Offset", reply.status),
            })
    }

    /// A completed upload must hold exactly the source's bytes.
    fn check_complete_length(&self, upload: UploadState, total: u64) -> Result<(), ClientError> {
        if upload.complete && upload.offset != total {
            return Err(ClientError::Protocol {
                message: format!(
                    "server reports a complete upload of {} bytes but the source has {total}",
                    upload.offset
                ),
            });
        }
        Ok(())
    }

    fn load_state(&self) -> Result<ResumeState, ClientError> {
        ResumeState::load(&self.state_path).map_err(|e| self.state_error(e))
    }

    fn save_state(&self, state: &ResumeState) -> Result<(), ClientError> {
        state.save(&self.state_path).map_err(|e| self.state_error(e))
    }

    fn state_error(&self, source: anyhow::Error) -> ClientError {
        ClientError::State {
            path: self.state_path.clone(),
            source,
        }
    }
}

fn location_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|e| ClientError::Protocol {
        message: format!("invalid header value {value:?}: {e}"),
    })
}
