//! Resumable HTTP uploads.
//!
//! This crate provides both sides of the resumable upload protocol: a
//! server engine with pluggable upload storage and idempotency index,
//! the axum routes exposing it, and a client driver that can pick an
//! interrupted upload back up from the offset the server reports.

use std::sync::Arc;

pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod locks;
pub mod metadata;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::engine::UploadEngine;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Upload protocol engine.
    pub engine: Arc<UploadEngine>,
}
