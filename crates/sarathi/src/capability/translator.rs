//! Translation adapter.

use serde::Deserialize;
use serde_json::Value;

use super::{parse_reply, to_request};
use crate::bridge::protocol::{TranslateReply, TranslateRequest};
use crate::cache::CacheKey;
use crate::client::{Capability, InvalidInput, UpstreamError};
use crate::language;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranslateInput {
    pub text: String,
    /// ISO code or language name.
    #[serde(alias = "targetLang")]
    pub target_lang: String,
}

impl TranslateInput {
    pub fn new(text: impl Into<String>, target_lang: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            target_lang: target_lang.into(),
        }
    }
}

/// Falls back to the untranslated text.
#[derive(Debug, Clone, Default)]
pub struct Translator {
    api_key: String,
}

impl Translator {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.unwrap_or_default(),
        }
    }
}

impl Capability for Translator {
    type Input = TranslateInput;
    type Output = String;

    fn name(&self) -> &'static str {
        "translate"
    }

    fn cache_key(&self, input: &TranslateInput) -> Option<CacheKey> {
        Some(CacheKey::new(self.name(), &input.text).param(&language::iso_code(&input.target_lang)))
    }

    fn short_circuit(&self, input: &TranslateInput) -> Option<String> {
        input.text.trim().is_empty().then(String::new)
    }

    fn encode(&self, input: &TranslateInput) -> Result<Value, InvalidInput> {
        to_request(&TranslateRequest {
            text: input.text.clone(),
            target_lang: language::iso_code(&input.target_lang),
            api_key: self.api_key.clone(),
        })
    }

    fn decode(&self, _input: &TranslateInput, reply: Value) -> Result<String, UpstreamError> {
        let reply: TranslateReply = parse_reply(reply)?;
        match reply.translated {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(UpstreamError::Shape("empty translation".to_string())),
        }
    }

    fn fallback(&self, input: &TranslateInput) -> String {
        input.text.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BridgeClient, FallbackReason, Source};
    use crate::config::BridgeConfig;
    use crate::spawner::CommandSpawner;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn language_names_share_cache_entries_with_codes() {
        let translator = Translator::default();
        assert_eq!(
            translator.cache_key(&TranslateInput::new("How are you", "Malayalam")),
            translator.cache_key(&TranslateInput::new(" how  ARE you", "ml"))
        );
        assert_ne!(
            translator.cache_key(&TranslateInput::new("How are you", "ml")),
            translator.cache_key(&TranslateInput::new("How are you", "ta"))
        );
    }

    #[test]
    fn encode_maps_language_and_injects_key() {
        let translator = Translator::new(Some("gsk_test".into()));
        let payload = translator.encode(&TranslateInput::new("Hello", "Hindi")).unwrap();
        assert_eq!(
            payload,
            json!({"text": "Hello", "target_lang": "hi", "apiKey": "gsk_test"})
        );
    }

    #[test]
    fn empty_translation_is_rejected() {
        let translator = Translator::default();
        let input = TranslateInput::new("Hello", "ml");
        assert!(translator.decode(&input, json!({"translated": ""})).is_err());
        assert!(translator.decode(&input, json!({})).is_err());
        assert_eq!(
            translator.decode(&input, json!({"translated": "നമസ്കാരം"})).unwrap(),
            "നമസ്കാരം"
        );
    }

    #[tokio::test]
    async fn translates_and_serves_repeat_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let script = r#"while IFS= read -r line; do
  printf '%s\n' "$line" >> "$LOG"
  printf '{"translated":"എങ്ങനെയുണ്ട്"}\n'
done"#;
        let client = BridgeClient::start(
            Translator::new(Some("gsk_test".into())),
            Arc::new(CommandSpawner::shell(script).env("LOG", log.as_os_str())),
            BridgeConfig::new().with_shutdown_grace(Duration::from_millis(200)),
        )
        .unwrap();

        let first = client
            .call_detailed(TranslateInput::new("How are you", "ml"))
            .await;
        assert_eq!(first.value, "എങ്ങനെയുണ്ട്");
        assert_eq!(first.source, Source::Worker);

        let key = CacheKey::new("translate", "how are you").param("ml");
        assert_eq!(client.cached(&key).as_deref(), Some("എങ്ങനെയുണ്ട്"));

        let second = client
            .call_detailed(TranslateInput::new("How are you", "ml"))
            .await;
        assert_eq!(second.value, "എങ്ങനെയുണ്ട്");
        assert_eq!(second.source, Source::Cache);

        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written.lines().count(), 1);
        let request: Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(request["text"], "How are you");
        assert_eq!(request["target_lang"], "ml");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn missing_key_reply_falls_back_to_original_text() {
        let script = r#"while IFS= read -r line; do
  printf '{"translated":"Hello","error":"No API key provided"}\n'
done"#;
        let client = BridgeClient::start(
            Translator::new(None),
            Arc::new(CommandSpawner::shell(script)),
            BridgeConfig::new().with_shutdown_grace(Duration::from_millis(200)),
        )
        .unwrap();

        let resolution = client.call_detailed(TranslateInput::new("Hello", "ml")).await;
        assert_eq!(resolution.value, "Hello");
        assert_eq!(
            resolution.source,
            Source::Fallback(FallbackReason::UpstreamError)
        );

        let empty = client.call_detailed(TranslateInput::new("  ", "ml")).await;
        assert_eq!(empty.value, "");
        assert_eq!(empty.source, Source::ShortCircuit);
        client.shutdown().await;
    }
}
