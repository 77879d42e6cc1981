//! Local filesystem storage backend.
//!
//! Each upload is a flat file `{root}/{id}` that only ever grows.  A
//! companion marker file `{root}/{id}.incomplete` exists while more bytes
//! may follow; removing it is what marks the upload complete.
//!
//! The file length is the upload offset, so bytes written before a client
//! disconnect are immediately visible to the next offset query.

use bytes::Bytes;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::backend::{UploadStore, WriteOutcome};
use crate::protocol::UploadState;

const MARKER_SUFFIX: &str = ".incomplete";

/// Stores uploads on the local filesystem.
pub struct LocalBackend {
    /// Directory holding upload data and marker files.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve an upload id to its data file path.
    ///
    /// Identifiers are server-minted UUIDs; anything outside
    /// `[A-Za-z0-9-]` is rejected so an id can never escape `root`.
    fn resolve(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            anyhow::bail!("Invalid upload id: {id:?}");
        }
        Ok(self.root.join(id))
    }

    fn marker_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}{MARKER_SUFFIX}"))
    }

    /// Read the state of `id`.
    ///
    /// The marker is checked before the length.  Bytes are never appended
    /// once the marker is gone, so a concurrent completion can only make
    /// this report an incomplete upload with a fresh offset, never a
    /// complete upload with a stale one.
    async fn load_state(&self, id: &str) -> anyhow::Result<Option<UploadState>> {
        let data_path = self.resolve(id)?;
        let complete = match tokio::fs::metadata(self.marker_path(id)).await {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        let offset = match tokio::fs::metadata(&data_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(UploadState { offset, complete }))
    }

    /// Check the write precondition shared by `append` and `set_complete`.
    async fn check_precondition(
        &self,
        id: &str,
        expected_offset: u64,
    ) -> anyhow::Result<Option<WriteOutcome>> {
        let outcome = match self.load_state(id).await? {
            None => Some(WriteOutcome::NotFound),
            Some(state) if state.complete => Some(WriteOutcome::AlreadyComplete {
                offset: state.offset,
            }),
            Some(state) if state.offset != expected_offset => Some(WriteOutcome::OffsetMismatch {
                actual: state.offset,
            }),
            Some(_) => None,
        };
        Ok(outcome)
    }
}

impl UploadStore for LocalBackend {
    fn create(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let data_path = self.resolve(&id)?;

            // Claim the id before touching its marker, so an existing upload
            // is never reopened.
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&data_path)
                .await;
            let file = match file {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    anyhow::bail!("Upload already exists: {id}")
                }
                Err(e) => return Err(e.into()),
            };
            tokio::fs::write(self.marker_path(&id), b"").await?;
            file.sync_all().await?;
            Ok(())
        })
    }

    fn state(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadState>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move { self.load_state(&id).await })
    }

    fn append(
        &self,
        id: &str,
        expected_offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteOutcome>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            if let Some(rejected) = self.check_precondition(&id, expected_offset).await? {
                return Ok(rejected);
            }

            let data_path = self.resolve(&id)?;
            let mut file = match OpenOptions::new().append(true).open(&data_path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(WriteOutcome::NotFound),
                Err(e) => return Err(e.into()),
            };

            let written = async {
                file.write_all(&data).await?;
                file.sync_data().await
            }
            .await;

            if let Err(e) = written {
                // Drop any partial chunk so the offset stays on a chunk boundary.
                if let Err(truncate_err) = file.set_len(expected_offset).await {
                    tracing::warn!(
                        upload_id = %id,
                        error = %truncate_err,
                        "Failed to roll back partial write"
                    );
                }
                return Err(e.into());
            }

            Ok(WriteOutcome::Committed(expected_offset + data.len() as u64))
        })
    }

    fn set_complete(
        &self,
        id: &str,
        expected_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteOutcome>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            if let Some(rejected) = self.check_precondition(&id, expected_offset).await? {
                return Ok(rejected);
            }
            tokio::fs::remove_file(self.marker_path(&id)).await?;
            Ok(WriteOutcome::Committed(expected_offset))
        })
    }

    fn delete(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let data_path = self.resolve(&id)?;
            match tokio::fs::remove_file(&data_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            // Best-effort: a missing marker just means the upload was complete.
            match tokio::fs::remove_file(self.marker_path(&id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "Failed to remove completeness marker")
                }
            }
            Ok(true)
        })
    }

    fn read(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let data_path = self.resolve(&id)?;
            match tokio::fs::read(&data_path).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
