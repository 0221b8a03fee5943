//! Wire protocol types for bridge ⇄ worker communication.
//!
//! Both directions are newline-delimited UTF-8 JSON, one request line in,
//! one reply line out. Field names follow what the helper scripts read and
//! write, so they are deliberately not uniform across capabilities.
//!
//! # Worker contract
//!
//! Replies are correlated positionally unless the worker echoes the `id`
//! field it was given. A worker that does not echo ids MUST emit exactly one
//! reply line per request line, in request order, and never batch, drop or
//! reorder replies.

use serde::{Deserialize, Serialize};

/// Identifier attached to each request line when tagging is enabled.
///
/// Monotonic per bridge instance; never reused across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field carrying the request id on tagged lines.
pub const ID_FIELD: &str = "id";

/// Add the request id to an outgoing payload.
///
/// Non-object payloads are wrapped untouched; workers only ever receive
/// objects from the built-in capabilities.
pub fn tag(mut payload: serde_json::Value, id: RequestId) -> serde_json::Value {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(ID_FIELD.to_string(), serde_json::Value::from(id.get()));
    }
    payload
}

/// Read the echoed request id from a reply, if the worker sent one.
pub fn reply_id(reply: &serde_json::Value) -> Option<RequestId> {
    reply.get(ID_FIELD)?.as_u64().map(RequestId::new)
}

/// Read the error field from a reply. Empty strings count as absent.
pub fn reply_error(reply: &serde_json::Value) -> Option<&str> {
    reply
        .get("error")
        .and_then(|e| e.as_str())
        .filter(|e| !e.trim().is_empty())
}

/// Intent matching request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub user_query: String,
    pub native_query: String,
    pub options: Vec<String>,
    pub api_key: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReply {
    #[serde(rename = "match")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_native: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Topic value meaning "nothing matched".
pub const NO_MATCH: &str = "NONE";

/// Translation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub text: String,
    pub target_lang: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslateReply {
    pub translated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Transcription request. `audio` is base64 without any data-URI prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeRequest {
    pub audio: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeReply {
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn match_request_serializes() {
        let req = MatchRequest {
            user_query: "how to send money".to_string(),
            native_query: "പണം അയക്കുന്നത് എങ്ങനെ".to_string(),
            options: vec!["send money to friend".to_string(), "check bank balance".to_string()],
            api_key: "gsk_test".to_string(),
            language: "Malayalam".to_string(),
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn translate_request_serializes() {
        let req = TranslateRequest {
            text: "How are you".to_string(),
            target_lang: "ml".to_string(),
            api_key: "gsk_test".to_string(),
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn transcribe_request_serializes() {
        let req = TranscribeRequest {
            audio: "UklGRg==".to_string(),
            language: "ml-IN".to_string(),
        };
        insta::assert_json_snapshot!(req);
    }

    #[test]
    fn match_reply_accepts_optional_fields() {
        let reply: MatchReply = serde_json::from_value(json!({
            "match": "check bank balance",
            "source": "ai",
            "correctedNative": "ബാലൻസ് നോക്കണം"
        }))
        .unwrap();
        assert_eq!(reply.topic, "check bank balance");
        assert_eq!(reply.corrected_native.as_deref(), Some("ബാലൻസ് നോക്കണം"));
        assert!(reply.error.is_none());

        let reply: MatchReply =
            serde_json::from_value(json!({"match": "NONE", "error": "boom"})).unwrap();
        assert_eq!(reply.topic, NO_MATCH);
        assert_eq!(reply.error.as_deref(), Some("boom"));
    }

    #[test]
    fn match_reply_requires_topic() {
        assert!(serde_json::from_value::<MatchReply>(json!({"source": "fuzzy_fallback"})).is_err());
    }

    #[test]
    fn transcribe_reply_text_is_optional() {
        let reply: TranscribeReply = serde_json::from_value(json!({"error": "bad audio"})).unwrap();
        assert!(reply.text.is_none());
        assert_eq!(reply.error.as_deref(), Some("bad audio"));
    }

    #[test]
    fn tag_and_read_back_id() {
        let tagged = tag(json!({"text": "hi"}), RequestId::new(7));
        assert_eq!(tagged["id"], 7);
        assert_eq!(reply_id(&tagged), Some(RequestId::new(7)));

        assert_eq!(reply_id(&json!({"text": "hi"})), None);
        assert_eq!(reply_id(&json!({"id": "seven"})), None);
    }

    #[test]
    fn reply_error_ignores_blank() {
        assert_eq!(reply_error(&json!({"error": "HTTP Error 429"})), Some("HTTP Error 429"));
        assert_eq!(reply_error(&json!({"error": ""})), None);
        assert_eq!(reply_error(&json!({"error": null})), None);
        assert_eq!(reply_error(&json!({"translated": "x"})), None);
    }
}
