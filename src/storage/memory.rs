//! In-memory storage backend.
//!
//! Uploads are held in a `tokio::sync::RwLock<HashMap<...>>`.  Nothing
//! survives a restart, which makes this backend the natural fake for
//! engine tests and ephemeral deployments.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::{UploadStore, WriteOutcome};
use crate::protocol::UploadState;

#[derive(Debug, Default)]
struct MemoryUpload {
    data: BytesMut,
    complete: bool,
}

impl MemoryUpload {
    fn state(&self) -> UploadState {
        UploadState {
            offset: self.data.len() as u64,
            complete: self.complete,
        }
    }

    fn check(&self, expected_offset: u64) -> Option<WriteOutcome> {
        let offset = self.data.len() as u64;
        if self.complete {
            Some(WriteOutcome::AlreadyComplete { offset })
        } else if offset != expected_offset {
            Some(WriteOutcome::OffsetMismatch { actual: offset })
        } else {
            None
        }
    }
}

/// In-memory upload store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    uploads: tokio::sync::RwLock<HashMap<String, MemoryUpload>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UploadStore for MemoryBackend {
    fn create(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut uploads = self.uploads.write().await;
            if uploads.contains_key(&id) {
                anyhow::bail!("Upload already exists: {id}");
            }
            uploads.insert(id, MemoryUpload::default());
            Ok(())
        })
    }

    fn state(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadState>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let uploads = self.uploads.read().await;
            Ok(uploads.get(&id).map(MemoryUpload::state))
        })
    }

    fn append(
        &self,
        id: &str,
        expected_offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteOutcome>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut uploads = self.uploads.write().await;
            let Some(upload) = uploads.get_mut(&id) else {
                return Ok(WriteOutcome::NotFound);
            };
            if let Some(rejected) = upload.check(expected_offset) {
                return Ok(rejected);
            }
            upload.data.extend_from_slice(&data);
            Ok(WriteOutcome::Committed(upload.data.len() as u64))
        })
    }

    fn set_complete(
        &self,
        id: &str,
        expected_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteOutcome>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut uploads = self.uploads.write().await;
            let Some(upload) = uploads.get_mut(&id) else {
                return Ok(WriteOutcome::NotFound);
            };
            if let Some(rejected) = upload.check(expected_offset) {
                return Ok(rejected);
            }
            upload.complete = true;
            Ok(WriteOutcome::Committed(expected_offset))
        })
    }

    fn delete(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.uploads.write().await.remove(&id).is_some()) })
    }

    fn read(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let uploads = self.uploads.read().await;
            Ok(uploads
                .get(&id)
                .map(|u| Bytes::copy_from_slice(&u.data)))
        })
    }
}
