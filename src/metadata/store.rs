//! Abstract idempotency index trait.
//!
//! Keys are always hashes produced by
//! [`crate::protocol::hash_idempotency_key`]; raw client tokens never
//! reach an index implementation.

use std::future::Future;
use std::pin::Pin;

/// Durable mapping from idempotency-token hash to upload id.
pub trait IdempotencyIndex: Send + Sync + 'static {
    /// Find the upload recorded for `key_hash`.
    fn lookup(
        &self,
        key_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;

    /// Point `key_hash` at `upload_id`, replacing any earlier record.
    ///
    /// Callers only replace a record whose upload no longer exists, and do
    /// so under the per-hash lock.
    fn record(
        &self,
        key_hash: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
