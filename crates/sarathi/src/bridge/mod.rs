//! Wire layer between a bridge and its worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Request/reply shapes per capability, request id tagging
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
