//! Caller-facing bridge: cache, breaker, dispatch and fallback.
//!
//! `call` never fails. Every runtime problem (crash, bad reply, upstream
//! error, timeout, open breaker) degrades to the capability's fallback value;
//! [`BridgeClient::call_detailed`] reports which path produced the value.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::bridge::protocol;
use crate::cache::{CacheKey, ResponseCache};
use crate::channel::Reply;
use crate::config::BridgeConfig;
use crate::health::WorkerHealth;
use crate::manager::WorkerProcessManager;
use crate::spawner::{SpawnError, WorkerSpawner};

/// The only error a caller ever sees: the worker could not be started.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to start {capability} worker: {source}")]
    Start {
        capability: &'static str,
        #[source]
        source: SpawnError,
    },
}

/// Classification of a reply that parsed but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream rate limited: {0}")]
    RateLimited(String),
    #[error("upstream error: {0}")]
    Other(String),
    #[error("unexpected reply shape: {0}")]
    Shape(String),
}

/// Input the adapter refuses to send to the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid input: {0}")]
pub struct InvalidInput(pub String);

/// Why a call resolved to its fallback value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    BreakerOpen,
    RateLimited,
    UpstreamError,
    MalformedReply,
    WorkerExited,
    Timeout,
    Unavailable,
    Stopped,
    InvalidInput,
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "reason")]
pub enum Source {
    Worker,
    Cache,
    /// Answered locally without contacting the worker (e.g. empty input).
    ShortCircuit,
    Fallback(FallbackReason),
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreakerOpen => "breaker_open",
            Self::RateLimited => "rate_limited",
            Self::UpstreamError => "upstream_error",
            Self::MalformedReply => "malformed_reply",
            Self::WorkerExited => "worker_exited",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Stopped => "stopped",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => f.write_str("worker"),
            Self::Cache => f.write_str("cache"),
            Self::ShortCircuit => f.write_str("short_circuit"),
            Self::Fallback(reason) => write!(f, "fallback:{}", reason.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    pub value: T,
    pub source: Source,
}

impl<T> Resolution<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, Source::Fallback(_))
    }
}

/// Per-capability request/reply schema.
pub trait Capability: Send + Sync + 'static {
    type Input: Send + Sync;
    type Output: Clone + Send + Sync + 'static;

    /// Short name used in logs and cache keys.
    fn name(&self) -> &'static str;

    /// `None` means the input is never cached.
    fn cache_key(&self, input: &Self::Input) -> Option<CacheKey>;

    /// Answer without the worker when the input makes a call pointless.
    fn short_circuit(&self, _input: &Self::Input) -> Option<Self::Output> {
        None
    }

    /// Build the request line.
    fn encode(&self, input: &Self::Input) -> Result<Value, InvalidInput>;

    /// Interpret an error-free reply.
    fn decode(&self, input: &Self::Input, reply: Value) -> Result<Self::Output, UpstreamError>;

    fn fallback(&self, input: &Self::Input) -> Self::Output;
}

/// One capability backed by one persistent worker.
pub struct BridgeClient<C: Capability> {
    capability: C,
    manager: WorkerProcessManager,
    cache: StdMutex<ResponseCache<C::Output>>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl<C: Capability> BridgeClient<C> {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(
        capability: C,
        spawner: Arc<dyn WorkerSpawner>,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let name = capability.name();
        let breaker = Arc::new(CircuitBreaker::new(config.cooldown, &config.rate_limit_markers));
        let cache = ResponseCache::new(config.cache_capacity);
        let call_timeout = config.call_timeout;

        let manager = WorkerProcessManager::start(name, spawner, config, Arc::clone(&breaker))
            .map_err(|source| BridgeError::Start {
                capability: name,
                source,
            })?;

        Ok(Self {
            capability,
            manager,
            cache: StdMutex::new(cache),
            breaker,
            call_timeout,
        })
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    pub async fn call(&self, input: C::Input) -> C::Output {
        self.call_detailed(input).await.value
    }

    pub async fn call_detailed(&self, input: C::Input) -> Resolution<C::Output> {
        let name = self.capability.name();

        if let Some(value) = self.capability.short_circuit(&input) {
            return Resolution {
                value,
                source: Source::ShortCircuit,
            };
        }

        let key = self.capability.cache_key(&input);
        if let Some(value) = key.as_ref().and_then(|k| self.cached(k)) {
            tracing::trace!(bridge = name, "Cache hit");
            return Resolution {
                value,
                source: Source::Cache,
            };
        }

        if self.breaker.should_bypass() {
            return self.fallback(&input, FallbackReason::BreakerOpen);
        }

        let payload = match self.capability.encode(&input) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(bridge = name, error = %e, "Rejected input");
                return self.fallback(&input, FallbackReason::InvalidInput);
            }
        };

        let (id, rx) = self.manager.dispatch(payload).await;
        let reply = match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Reply::Stopped,
            Err(_) => {
                tracing::warn!(
                    bridge = name,
                    request_id = %id,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Worker reply timed out"
                );
                self.manager.expire(id).await;
                return self.fallback(&input, FallbackReason::Timeout);
            }
        };

        let value = match reply {
            Reply::Value(value) => value,
            Reply::Malformed => return self.fallback(&input, FallbackReason::MalformedReply),
            Reply::WorkerExited => return self.fallback(&input, FallbackReason::WorkerExited),
            Reply::Unavailable => return self.fallback(&input, FallbackReason::Unavailable),
            Reply::Stopped => return self.fallback(&input, FallbackReason::Stopped),
        };

        match self.interpret(&input, value) {
            Ok(output) => {
                if let Some(key) = key {
                    self.lock_cache().put(key, output.clone());
                }
                Resolution {
                    value: output,
                    source: Source::Worker,
                }
            }
            Err(e) => {
                let reason = match e {
                    UpstreamError::RateLimited(_) => FallbackReason::RateLimited,
                    UpstreamError::Other(_) => FallbackReason::UpstreamError,
                    UpstreamError::Shape(_) => FallbackReason::MalformedReply,
                };
                tracing::warn!(bridge = name, request_id = %id, error = %e, "Worker reported failure");
                self.fallback(&input, reason)
            }
        }
    }

    fn interpret(&self, input: &C::Input, value: Value) -> Result<C::Output, UpstreamError> {
        if let Some(error) = protocol::reply_error(&value) {
            return Err(if self.breaker.is_rate_limit(error) {
                UpstreamError::RateLimited(error.to_string())
            } else {
                UpstreamError::Other(error.to_string())
            });
        }
        self.capability.decode(input, value)
    }

    fn fallback(&self, input: &C::Input, reason: FallbackReason) -> Resolution<C::Output> {
        tracing::debug!(bridge = self.capability.name(), ?reason, "Resolving with fallback");
        Resolution {
            value: self.capability.fallback(input),
            source: Source::Fallback(reason),
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ResponseCache<C::Output>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached value for a key, without refreshing it.
    pub fn cached(&self, key: &CacheKey) -> Option<C::Output> {
        self.lock_cache().get(key)
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn health(&self) -> WorkerHealth {
        self.manager.health()
    }

    pub fn breaker_state(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn manager(&self) -> &WorkerProcessManager {
        &self.manager
    }

    /// Stop the worker. Returns how many waiting calls fell back because of it.
    pub async fn shutdown(&self) -> usize {
        self.manager.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::CommandSpawner;
    use serde_json::json;
    use std::path::Path;

    /// Plain text in, plain text out: `{"text": ..}` → `{"out": ..}`.
    struct Echo;

    impl Capability for Echo {
        type Input = String;
        type Output = String;

        fn name(&self) -> &'static str {
            "echo"
        }

        fn cache_key(&self, input: &String) -> Option<CacheKey> {
            Some(CacheKey::new("echo", input))
        }

        fn short_circuit(&self, input: &String) -> Option<String> {
            input.is_empty().then(String::new)
        }

        fn encode(&self, input: &String) -> Result<Value, InvalidInput> {
            Ok(json!({ "text": input }))
        }

        fn decode(&self, _input: &String, reply: Value) -> Result<String, UpstreamError> {
            reply["out"]
                .as_str()
                .map(String::from)
                .ok_or_else(|| UpstreamError::Shape(reply.to_string()))
        }

        fn fallback(&self, input: &String) -> String {
            format!("fallback:{input}")
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig::new()
            .with_restart_delay(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_millis(200))
    }

    fn logging_worker(log: &Path, body: &str) -> Arc<dyn WorkerSpawner> {
        let script = format!(
            "while IFS= read -r line; do\n  printf '%s\\n' \"$line\" >> \"$LOG\"\n{body}\ndone"
        );
        Arc::new(CommandSpawner::shell(&script).env("LOG", log.as_os_str()))
    }

    fn writes(log: &Path) -> usize {
        std::fs::read_to_string(log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    const OK_REPLY: &str = r#"  printf '{"out":"ok"}\n'"#;

    #[tokio::test]
    async fn cache_hit_skips_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let client = BridgeClient::start(Echo, logging_worker(&log, OK_REPLY), config()).unwrap();

        let first = client.call_detailed("Hello".into()).await;
        let second = client.call_detailed("  hello ".into()).await;

        assert_eq!(first.source, Source::Worker);
        assert_eq!(second.source, Source::Cache);
        assert_eq!(first.value, second.value);
        assert_eq!(writes(&log), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn short_circuit_never_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let client = BridgeClient::start(Echo, logging_worker(&log, OK_REPLY), config()).unwrap();

        let resolution = client.call_detailed(String::new()).await;
        assert_eq!(resolution.source, Source::ShortCircuit);
        assert_eq!(client.cache_len(), 0);
        assert_eq!(writes(&log), 0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limit_opens_breaker_until_cooldown_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let body = r#"  n=$((n+1))
  if [ "$n" -eq 1 ]; then
    printf '{"error":"Error code: 429 - rate_limit_exceeded"}\n'
  else
    printf '{"out":"ok"}\n'
  fi"#;
        let cooldown = Duration::from_millis(300);
        let client = BridgeClient::start(
            Echo,
            logging_worker(&log, body),
            config().with_cooldown(cooldown),
        )
        .unwrap();

        let limited = client.call_detailed("one".into()).await;
        assert_eq!(limited.source, Source::Fallback(FallbackReason::RateLimited));
        assert_eq!(limited.value, "fallback:one");

        tokio::time::sleep(Duration::from_millis(1)).await;
        let bypassed = client.call_detailed("two".into()).await;
        assert_eq!(bypassed.source, Source::Fallback(FallbackReason::BreakerOpen));
        assert_eq!(writes(&log), 1);

        tokio::time::sleep(cooldown).await;
        let recovered = client.call_detailed("three".into()).await;
        assert_eq!(recovered.source, Source::Worker);
        assert_eq!(recovered.value, "ok");
        assert_eq!(writes(&log), 2);
        assert_eq!(client.breaker_state().trips, 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let body = r#"  printf '{"error":"model not found"}\n'"#;
        let client = BridgeClient::start(Echo, logging_worker(&log, body), config()).unwrap();

        for _ in 0..2 {
            let resolution = client.call_detailed("hi".into()).await;
            assert_eq!(resolution.source, Source::Fallback(FallbackReason::UpstreamError));
        }
        assert_eq!(client.cache_len(), 0);
        assert_eq!(writes(&log), 2);
        assert_eq!(client.breaker_state().trips, 0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_reply_shape_falls_back() {
        let client = BridgeClient::start(
            Echo,
            Arc::new(CommandSpawner::shell(
                r#"while IFS= read -r line; do printf '{"unexpected":1}\n'; done"#,
            )),
            config(),
        )
        .unwrap();

        let resolution = client.call_detailed("hi".into()).await;
        assert_eq!(resolution.source, Source::Fallback(FallbackReason::MalformedReply));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn late_reply_is_never_given_to_the_next_caller() {
        // Id-unaware worker; "slow" is answered long after the caller gave up.
        let body = r#"  case "$line" in
    *slow*) sleep 1 >/dev/null 2>&1; printf '{"out":"answer-for-slow"}\n' ;;
    *fast*) printf '{"out":"answer-for-fast"}\n' ;;
  esac"#;
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let client = BridgeClient::start(
            Echo,
            logging_worker(&log, body),
            config().with_call_timeout(Duration::from_millis(300)),
        )
        .unwrap();

        let slow = client.call_detailed("slow".into()).await;
        assert_eq!(slow.source, Source::Fallback(FallbackReason::Timeout));
        assert_eq!(slow.value, "fallback:slow");

        // Stuck behind "slow"; the worker is replaced once two calls miss.
        let fast = client.call_detailed("fast".into()).await;
        assert_eq!(fast.source, Source::Fallback(FallbackReason::Timeout));

        let again = client.call_detailed("fast".into()).await;
        assert_eq!(again.source, Source::Worker);
        assert_eq!(again.value, "answer-for-fast");
        assert_eq!(
            client.cached(&CacheKey::new("echo", "fast")).as_deref(),
            Some("answer-for-fast")
        );
        assert_eq!(client.cache_len(), 1);
        assert_eq!(client.manager().restarts(), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn unanswered_request_recovers_after_grace() {
        let body = r#"  case "$line" in
    *slow*) ;;
    *) printf '{"out":"ok"}\n' ;;
  esac"#;
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let client = BridgeClient::start(
            Echo,
            logging_worker(&log, body),
            config()
                .with_call_timeout(Duration::from_millis(200))
                .with_late_reply_grace(Duration::from_millis(200)),
        )
        .unwrap();

        let slow = client.call_detailed("slow".into()).await;
        assert_eq!(slow.source, Source::Fallback(FallbackReason::Timeout));

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.manager().restarts() == 0 || client.health() != WorkerHealth::Ready {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let next = client.call_detailed("fast".into()).await;
        assert_eq!(next.source, Source::Worker);
        assert_eq!(next.value, "ok");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn user_text_echoed_on_stderr_does_not_open_the_breaker() {
        let body = r#"  echo "Translating: '$line' to 'ml'" >&2
  printf '{"out":"ok"}\n'"#;
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("writes.log");
        let client = BridgeClient::start(Echo, logging_worker(&log, body), config()).unwrap();

        for text in ["My UPI PIN ends in 4290", "What is the interest rate limit?"] {
            let resolution = client.call_detailed(text.into()).await;
            assert_eq!(resolution.source, Source::Worker);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let next = client.call_detailed("Hello friend".into()).await;
        assert_eq!(next.source, Source::Worker);
        assert_eq!(client.breaker_state().trips, 0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let result = BridgeClient::start(
            Echo,
            Arc::new(CommandSpawner::new("/nonexistent/sarathi-worker")),
            config(),
        );
        let Err(err) = result else {
            panic!("start should fail");
        };
        assert!(err.to_string().starts_with("failed to start echo worker"));
    }

    #[tokio::test]
    async fn calls_after_shutdown_fall_back() {
        let client = BridgeClient::start(
            Echo,
            Arc::new(CommandSpawner::shell(
                r#"while IFS= read -r line; do printf '{"out":"ok"}\n'; done"#,
            )),
            config(),
        )
        .unwrap();
        client.shutdown().await;

        let resolution = client.call_detailed("late".into()).await;
        assert_eq!(resolution.source, Source::Fallback(FallbackReason::Stopped));
        assert_eq!(client.health(), WorkerHealth::Stopped);
    }

    #[test]
    fn source_serializes_with_reason() {
        insta::assert_json_snapshot!(
            "source_variants",
            [
                Source::Worker,
                Source::Cache,
                Source::ShortCircuit,
                Source::Fallback(FallbackReason::BreakerOpen),
            ]
        );
    }
}
