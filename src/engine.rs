//! Server side of the resumable upload protocol.
//!
//! [`UploadEngine`] implements the four operations (create, append, query
//! offset, cancel) over an [`UploadStore`] and an [`IdempotencyIndex`].
//! It knows nothing about HTTP routing: the axum handlers translate
//! requests into calls here, and [`UploadOutcome`] / [`UploadError`] back
//! into responses.
//!
//! Request bodies are consumed as streams and written chunk by chunk, so
//! whatever reached storage before a disconnect stays committed and shows
//! up in the next offset query.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use metrics::counter;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::UploadError;
use crate::locks::KeyedLocks;
use crate::metadata::store::IdempotencyIndex;
use crate::metrics::BYTES_RECEIVED_TOTAL;
use crate::protocol::{hash_idempotency_key, ProtocolVersion, UploadState};
use crate::storage::backend::{UploadStore, WriteOutcome};

/// Streamed request body.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Early announcement of the upload resource, sent before the body is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisional {
    pub location: String,
    /// Bytes already stored, when a create resumes an existing upload.
    pub offset: Option<u64>,
    pub version: ProtocolVersion,
}

/// Parameters of a creation request.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Raw client token; hashed before it reaches the index.
    pub idempotency_key: Option<String>,
    /// Whether the client declared this request the last one.
    pub complete: bool,
    pub version: ProtocolVersion,
}

/// Successful result of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub status: StatusCode,
    /// Resource location, set by creation.
    pub location: Option<String>,
    pub state: UploadState,
}

/// How a resume-via-create prefix skip ended.
enum Skip {
    /// `offset` bytes were discarded; holds any bytes past them from the last chunk.
    Done(Option<Bytes>),
    /// The body ended after this many bytes, before reaching the offset.
    EndedAt(u64),
}

pub struct UploadEngine {
    store: Arc<dyn UploadStore>,
    index: Arc<dyn IdempotencyIndex>,
    locks: KeyedLocks,
    /// Base URL that upload locations are built from, without trailing slash.
    public_url: String,
}

fn upload_lock(id: &str) -> String {
    format!("upload:{id}")
}

fn idempotency_lock(hash: &str) -> String {
    format!("idempotency:{hash}")
}

/// Identifiers are minted by [`UploadEngine::create`]; anything else can
/// never name an upload.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn announce(tx: Option<oneshot::Sender<Provisional>>, provisional: Provisional) {
    if let Some(tx) = tx {
        debug!(location = %provisional.location, "Announcing upload location");
        // A dropped receiver just means nobody is listening.
        let _ = tx.send(provisional);
    }
}

/// Translate a refused conditional write into the matching error.
fn rejected(id: &str, expected: u64, outcome: WriteOutcome) -> UploadError {
    match outcome {
        WriteOutcome::NotFound | WriteOutcome::Committed(_) => UploadError::NotFound { id: id.to_string() },
        WriteOutcome::OffsetMismatch { actual } => UploadError::OffsetConflict {
            client_offset: expected,
            state: UploadState::incomplete(actual),
        },
        WriteOutcome::AlreadyComplete { offset } => UploadError::AlreadyComplete {
            state: UploadState {
                offset,
                complete: true,
            },
        },
    }
}

impl UploadEngine {
    pub fn new(
        store: Arc<dyn UploadStore>,
        index: Arc<dyn IdempotencyIndex>,
        public_url: &str,
    ) -> Self {
        Self {
            store,
            index,
            locks: KeyedLocks::new(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Absolute location of upload `id`.
    pub fn location(&self, id: &str) -> String {
        format!("{}/uploads/{id}", self.public_url)
    }

    /// The backing upload store.
    pub fn store(&self) -> &Arc<dyn UploadStore> {
        &self.store
    }

    /// Create an upload, or resume the one an idempotency key points at.
    ///
    /// `provisional` receives the location before the body is consumed.
    /// It is not used when the key resolves to an already complete upload,
    /// since that body is never read.
    pub async fn create(
        &self,
        request: CreateRequest,
        body: BodyStream,
        provisional: Option<oneshot::Sender<Provisional>>,
    ) -> Result<UploadOutcome, UploadError> {
        let key_hash = request.idempotency_key.as_deref().map(hash_idempotency_key);
        let _key_guard = match &key_hash {
            Some(hash) => Some(self.locks.lock(&idempotency_lock(hash)).await),
            None => None,
        };

        if let Some(hash) = &key_hash {
            if let Some(id) = self.index.lookup(hash).await? {
                let _upload_guard = self.locks.lock(&upload_lock(&id)).await;
                match self.store.state(&id).await? {
                    Some(state) if state.complete => {
                        info!(upload_id = %id, offset = state.offset, "Create retried for completed upload");
                        return Ok(UploadOutcome {
                            status: StatusCode::OK,
                            location: Some(self.location(&id)),
                            state,
                        });
                    }
                    Some(state) => {
                        return self
                            .resume_via_create(&id, state, &request, body, provisional)
                            .await;
                    }
                    None => {
                        warn!(upload_id = %id, "Idempotency record points at a missing upload, creating a new one");
                    }
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        self.store.create(&id).await?;
        if let Some(hash) = &key_hash {
            self.index.record(hash, &id).await?;
        }
        let _upload_guard = self.locks.lock(&upload_lock(&id)).await;
        info!(upload_id = %id, version = %request.version, "Upload created");

        let location = self.location(&id);
        announce(
            provisional,
            Provisional {
                location: location.clone(),
                offset: None,
                version: request.version,
            },
        );

        let state = self
            .stream_into(&id, UploadState::incomplete(0), body, request.complete)
            .await?;
        if state.complete {
            info!(upload_id = %id, offset = state.offset, "Upload complete");
        }
        Ok(UploadOutcome {
            status: StatusCode::CREATED,
            location: Some(location),
            state,
        })
    }

    /// Continue an incomplete upload through a retried create.  The first
    /// `state.offset` bytes of `body` are assumed to be what is already
    /// stored and are discarded unread.
    async fn resume_via_create(
        &self,
        id: &str,
        state: UploadState,
        request: &CreateRequest,
        mut body: BodyStream,
        provisional: Option<oneshot::Sender<Provisional>>,
    ) -> Result<UploadOutcome, UploadError> {
        let location = self.location(id);
        info!(upload_id = %id, offset = state.offset, "Create resumes existing upload");
        announce(
            provisional,
            Provisional {
                location: location.clone(),
                offset: (state.offset > 0).then_some(state.offset),
                version: request.version,
            },
        );

        let leftover = match skip_prefix(&mut body, state.offset).await {
            Ok(Skip::Done(leftover)) => leftover,
            Ok(Skip::EndedAt(received)) => {
                debug!(upload_id = %id, received, offset = state.offset, "Resumed create body shorter than stored prefix");
                return Err(UploadError::OffsetConflict {
                    client_offset: received,
                    state,
                });
            }
            Err(source) => {
                return Err(UploadError::Interrupted {
                    state: Some(state),
                    source,
                })
            }
        };
        let rest: BodyStream = Box::pin(futures_util::stream::iter(leftover.map(Ok)).chain(body));

        let state = self.stream_into(id, state, rest, request.complete).await?;
        if state.complete {
            info!(upload_id = %id, offset = state.offset, "Upload complete");
        }
        Ok(UploadOutcome {
            status: StatusCode::CREATED,
            location: Some(location),
            state,
        })
    }

    /// Append `body` to upload `id` at `client_offset`.
    pub async fn append(
        &self,
        id: &str,
        client_offset: Option<u64>,
        complete: bool,
        body: BodyStream,
    ) -> Result<UploadOutcome, UploadError> {
        if !is_valid_id(id) {
            return Err(UploadError::NotFound { id: id.to_string() });
        }
        let _guard = self.locks.lock(&upload_lock(id)).await;

        let state = self
            .store
            .state(id)
            .await?
            .ok_or_else(|| UploadError::NotFound { id: id.to_string() })?;
        let client_offset = client_offset.ok_or(UploadError::InvalidOffset)?;
        if client_offset != state.offset {
            debug!(upload_id = %id, client_offset, server_offset = state.offset, "Offset mismatch");
            return Err(UploadError::OffsetConflict {
                client_offset,
                state,
            });
        }
        if state.complete {
            return Err(UploadError::AlreadyComplete { state });
        }

        let state = self.stream_into(id, state, body, complete).await?;
        if state.complete {
            info!(upload_id = %id, offset = state.offset, "Upload complete");
        }
        Ok(UploadOutcome {
            status: StatusCode::OK,
            location: None,
            state,
        })
    }

    /// Current state of upload `id`.  No side effects.
    pub async fn query_offset(&self, id: &str) -> Result<UploadState, UploadError> {
        if !is_valid_id(id) {
            return Err(UploadError::NotFound { id: id.to_string() });
        }
        self.store
            .state(id)
            .await?
            .ok_or_else(|| UploadError::NotFound { id: id.to_string() })
    }

    /// Delete upload `id` with all its bytes.
    ///
    /// Any idempotency record pointing at it is left in place; a later
    /// create with that key finds the upload gone and starts over.
    pub async fn cancel(&self, id: &str) -> Result<(), UploadError> {
        if !is_valid_id(id) || !self.store.delete(id).await? {
            return Err(UploadError::NotFound { id: id.to_string() });
        }
        info!(upload_id = %id, "Upload cancelled");
        Ok(())
    }

    /// Write every chunk of `body` to `id`, starting at `state.offset`,
    /// then mark the upload complete if the client asked for it.
    ///
    /// Each chunk is a compare-and-append against the offset reached so
    /// far; on a read error the bytes already written stay committed.
    async fn stream_into(
        &self,
        id: &str,
        mut state: UploadState,
        mut body: BodyStream,
        complete: bool,
    ) -> Result<UploadState, UploadError> {
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    warn!(upload_id = %id, offset = state.offset, error = %source, "Request body interrupted");
                    return Err(UploadError::Interrupted {
                        state: Some(state),
                        source,
                    });
                }
            };
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            match self.store.append(id, state.offset, chunk).await? {
                WriteOutcome::Committed(offset) => {
                    counter!(BYTES_RECEIVED_TOTAL).increment(len);
                    state.offset = offset;
                }
                other => return Err(rejected(id, state.offset, other)),
            }
        }

        if complete {
            match self.store.set_complete(id, state.offset).await? {
                WriteOutcome::Committed(_) => state.complete = true,
                other => return Err(rejected(id, state.offset, other)),
            }
        }
        Ok(state)
    }
}

/// Discard the first `offset` bytes of `body`.
async fn skip_prefix(body: &mut BodyStream, offset: u64) -> io::Result<Skip> {
    let mut remaining = offset;
    while remaining > 0 {
        let Some(chunk) = body.next().await else {
            return Ok(Skip::EndedAt(offset - remaining));
        };
        let mut chunk = chunk?;
        let len = chunk.len() as u64;
        if len <= remaining {
            remaining -= len;
        } else {
            let rest = chunk.split_off(remaining as usize);
            return Ok(Skip::Done(Some(rest)));
        }
    }
    Ok(Skip::Done(None))
}
