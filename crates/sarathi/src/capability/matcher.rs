//! Intent matching adapter.
//!
//! The helper picks which candidate topic the user's query is about. Its
//! answer is only trusted if it names one of the candidates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_reply, to_request};
use crate::bridge::protocol::{MatchReply, MatchRequest, NO_MATCH};
use crate::cache::{CacheKey, normalize};
use crate::client::{Capability, InvalidInput, UpstreamError};
use crate::language;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchInput {
    /// Query in English.
    pub user_query: String,
    /// Query as the user said it.
    #[serde(default)]
    pub native_query: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl MatchInput {
    pub fn new(user_query: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            user_query: user_query.into(),
            native_query: String::new(),
            options,
            language: None,
        }
    }

    pub fn with_native_query(mut self, native_query: impl Into<String>) -> Self {
        self.native_query = native_query.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    #[serde(rename = "match")]
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_native: Option<String>,
}

impl MatchOutcome {
    pub fn none() -> Self {
        Self {
            topic: NO_MATCH.to_string(),
            corrected_native: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.topic != NO_MATCH
    }
}

/// Falls back to `{match: "NONE"}`.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    api_key: String,
}

impl Matcher {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.unwrap_or_default(),
        }
    }
}

impl Capability for Matcher {
    type Input = MatchInput;
    type Output = MatchOutcome;

    fn name(&self) -> &'static str {
        "match"
    }

    fn cache_key(&self, input: &MatchInput) -> Option<CacheKey> {
        Some(
            CacheKey::new(self.name(), &input.user_query)
                .param(&input.native_query)
                .param(&language::display_name(input.language.as_deref()))
                .set(input.options.iter().map(String::as_str)),
        )
    }

    fn short_circuit(&self, input: &MatchInput) -> Option<MatchOutcome> {
        (input.user_query.trim().is_empty() || input.options.is_empty()).then(MatchOutcome::none)
    }

    fn encode(&self, input: &MatchInput) -> Result<Value, InvalidInput> {
        to_request(&MatchRequest {
            user_query: input.user_query.clone(),
            native_query: input.native_query.clone(),
            options: input.options.clone(),
            api_key: self.api_key.clone(),
            language: language::display_name(input.language.as_deref()),
        })
    }

    fn decode(&self, input: &MatchInput, reply: Value) -> Result<MatchOutcome, UpstreamError> {
        let reply: MatchReply = parse_reply(reply)?;
        if reply.topic.trim().is_empty() {
            return Err(UpstreamError::Shape("empty match".to_string()));
        }
        let corrected_native = reply.corrected_native.filter(|c| !c.trim().is_empty());

        if reply.topic == NO_MATCH {
            return Ok(MatchOutcome {
                topic: NO_MATCH.to_string(),
                corrected_native,
            });
        }

        // Report the caller's spelling of the topic.
        let wanted = normalize(&reply.topic);
        match input.options.iter().find(|o| normalize(o) == wanted) {
            Some(option) => Ok(MatchOutcome {
                topic: option.clone(),
                corrected_native,
            }),
            None => {
                tracing::debug!(topic = %reply.topic, "Worker matched a topic outside the options");
                Ok(MatchOutcome {
                    topic: NO_MATCH.to_string(),
                    corrected_native,
                })
            }
        }
    }

    fn fallback(&self, _input: &MatchInput) -> MatchOutcome {
        MatchOutcome::none()
    }
}
