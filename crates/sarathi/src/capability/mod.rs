//! Adapters for the three helper processes.
//!
//! Each adapter only knows its request/reply schema, its cache key and its
//! fallback; everything else is shared through [`crate::client::BridgeClient`].

pub mod matcher;
pub mod transcriber;
pub mod translator;

pub use matcher::{MatchInput, MatchOutcome, Matcher};
pub use transcriber::{TranscribeInput, Transcriber, Transcript};
pub use translator::{TranslateInput, Translator};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{InvalidInput, UpstreamError};

fn to_request<T: Serialize>(request: &T) -> Result<Value, InvalidInput> {
    serde_json::to_value(request).map_err(|e| InvalidInput(e.to_string()))
}

fn parse_reply<T: DeserializeOwned>(reply: Value) -> Result<T, UpstreamError> {
    serde_json::from_value(reply).map_err(|e| UpstreamError::Shape(e.to_string()))
}
