//! Upload storage backends.
//!
//! The [`backend::UploadStore`] trait abstracts over where upload bytes
//! physically live.  Implementations include the local filesystem and an
//! in-memory map for tests and ephemeral deployments.

pub mod backend;
pub mod local;
pub mod memory;
