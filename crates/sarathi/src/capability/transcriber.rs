//! Speech transcription adapter.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_reply, to_request};
use crate::bridge::protocol::{TranscribeReply, TranscribeRequest};
use crate::cache::CacheKey;
use crate::client::{Capability, InvalidInput, UpstreamError};
use crate::language;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscribeInput {
    /// Base64 audio, optionally as a `data:` URI.
    pub audio: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl TranscribeInput {
    pub fn new(audio: impl Into<String>, language: Option<String>) -> Self {
        Self {
            audio: audio.into(),
            language,
        }
    }

    /// The base64 payload with any `data:...;base64,` prefix removed.
    pub fn payload(&self) -> &str {
        strip_data_uri(&self.audio)
    }

    fn locale(&self) -> &'static str {
        language::speech_locale(self.language.as_deref().unwrap_or_default())
    }
}

/// Everything after the last comma; base64 never contains one.
pub fn strip_data_uri(audio: &str) -> &str {
    audio.rsplit_once(',').map_or(audio, |(_, payload)| payload).trim()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    pub text: String,
}

/// Falls back to an empty transcript.
#[derive(Debug, Clone, Default)]
pub struct Transcriber;

impl Capability for Transcriber {
    type Input = TranscribeInput;
    type Output = Transcript;

    fn name(&self) -> &'static str {
        "transcribe"
    }

    fn cache_key(&self, input: &TranscribeInput) -> Option<CacheKey> {
        Some(CacheKey::new(self.name(), input.locale()).digest(input.payload().as_bytes()))
    }

    fn short_circuit(&self, input: &TranscribeInput) -> Option<Transcript> {
        input.payload().is_empty().then(Transcript::default)
    }

    fn encode(&self, input: &TranscribeInput) -> Result<Value, InvalidInput> {
        let audio = input.payload();
        STANDARD
            .decode(audio)
            .map_err(|e| InvalidInput(format!("audio is not base64: {e}")))?;
        to_request(&TranscribeRequest {
            audio: audio.to_string(),
            language: input.locale().to_string(),
        })
    }

    fn decode(&self, _input: &TranscribeInput, reply: Value) -> Result<Transcript, UpstreamError> {
        let reply: TranscribeReply = parse_reply(reply)?;
        let text = reply
            .text
            .ok_or_else(|| UpstreamError::Shape("missing text".to_string()))?;
        // The helper reports a failed recognition as an empty transcript.
        match text.trim() {
            "" => Err(UpstreamError::Other("empty transcript".to_string())),
            text => Ok(Transcript {
                text: text.to_string(),
            }),
        }
    }

    fn fallback(&self, _input: &TranscribeInput) -> Transcript {
        Transcript::default()
    }
}
