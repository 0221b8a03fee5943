//! HTTP transport via axum.

mod routes;
mod server;

pub use routes::{SOURCE_HEADER, TranslateResponse, routes};
pub use server::{ServerConfig, serve};
