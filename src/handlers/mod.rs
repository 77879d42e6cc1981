//! HTTP request handlers.

pub mod uploads;
