//! Idempotency index.
//!
//! Retried creation requests carry the same client token; the index maps
//! the token's hash to the upload it created so the retry converges on the
//! same resource.  The [`store::IdempotencyIndex`] trait defines the
//! interface; [`sqlite::SqliteIdempotencyIndex`] is the default
//! implementation.

pub mod memory;
pub mod sqlite;
pub mod store;
