//! Transport layer for sarathi.
//!
//! Exposes the bridges over HTTP via axum.

pub mod http;

pub use http::{ServerConfig, serve};
