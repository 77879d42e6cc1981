//! Abstract upload store trait.
//!
//! Every storage backend must implement [`UploadStore`].  Writes are
//! compare-and-append: the caller states the offset it believes the
//! upload is at, and the backend refuses the write if that is no longer
//! true.  This keeps the offset check and the write in one step even if a
//! caller forgets to hold the engine's per-upload lock.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

use crate::protocol::UploadState;

/// Result of a conditional write against one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write happened; the upload now ends at this offset.
    Committed(u64),
    /// The upload is at `actual`, not at the expected offset.  Nothing was written.
    OffsetMismatch { actual: u64 },
    /// The upload was already complete.  Nothing was written.
    AlreadyComplete { offset: u64 },
    /// No upload with this identifier exists.
    NotFound,
}

/// Async upload storage contract.
pub trait UploadStore: Send + Sync + 'static {
    /// Create an empty, incomplete upload.  Fails if `id` already exists.
    fn create(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Current `(offset, complete)` of `id`, or `None` if it does not exist.
    fn state(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadState>>> + Send + '_>>;

    /// Append `data` to `id` if it currently ends at `expected_offset` and
    /// is not complete.
    fn append(
        &self,
        id: &str,
        expected_offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteOutcome>> + Send + '_>>;

    /// Mark `id` complete if it currently ends at `expected_offset`.
    fn set_complete(
        &self,
        id: &str,
        expected_offset: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<WriteOutcome>> + Send + '_>>;

    /// Delete `id` and its completeness marker.  Returns `false` if it did
    /// not exist.
    fn delete(&self, id: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Read the bytes stored so far for `id`.
    fn read(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>>;
}
