//! In-memory idempotency index.
//!
//! No persistence. Useful for testing and ephemeral deployments.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use super::store::IdempotencyIndex;

#[derive(Debug, Default)]
pub struct MemoryIdempotencyIndex {
    records: RwLock<HashMap<String, String>>,
}

impl MemoryIdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyIndex for MemoryIdempotencyIndex {
    fn lookup(
        &self,
        key_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let found = self
            .records
            .read()
            .expect("rwlock poisoned")
            .get(key_hash)
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn record(
        &self,
        key_hash: &str,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        self.records
            .write()
            .expect("rwlock poisoned")
            .insert(key_hash.to_string(), upload_id.to_string());
        Box::pin(async move { Ok(()) })
    }
}
