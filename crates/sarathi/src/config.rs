//! Bridge and service configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;

/// Phrases that only appear in upstream throttling errors: urllib's
/// `HTTP Error 429`, the Groq client's `Error code: 429` and its
/// `RateLimitError`, and the API's `rate_limit_exceeded` code. Bare digits are
/// not enough since helpers echo user text to stderr.
pub const DEFAULT_RATE_LIMIT_MARKERS: &[&str] = &[
    "http error 429",
    "error code: 429",
    "status code: 429",
    "status 429",
    "ratelimiterror",
    "rate_limit_exceeded",
    "rate limit reached",
];

/// Tunables for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Delay before a crashed worker is respawned.
    pub restart_delay: Duration,
    /// Per-call deadline; an expired call resolves to the fallback.
    pub call_timeout: Duration,
    /// Maximum cached results (0 disables the cache).
    pub cache_capacity: usize,
    /// How long the breaker stays open after a rate-limit signal.
    pub cooldown: Duration,
    /// Case-insensitive substrings that identify upstream rate limiting.
    pub rate_limit_markers: Vec<String>,
    pub max_line_bytes: usize,
    /// Consecutive short-lived starts before the bridge reports degraded.
    pub degraded_after: u32,
    /// A worker that lives at least this long resets the failure count.
    pub min_healthy_uptime: Duration,
    /// Time a worker gets to exit after stdin closes on shutdown.
    pub shutdown_grace: Duration,
    /// Attach an `id` field to every request line.
    pub tag_requests: bool,
    /// How long a timed-out request may wait for its late reply before the
    /// worker is replaced to bring replies back in step.
    pub late_reply_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            cache_capacity: 256,
            cooldown: Duration::from_secs(60),
            rate_limit_markers: DEFAULT_RATE_LIMIT_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            degraded_after: 3,
            min_healthy_uptime: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(3),
            tag_requests: true,
            late_reply_grace: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_rate_limit_markers(mut self, markers: Vec<String>) -> Self {
        self.rate_limit_markers = markers;
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    pub fn with_degraded_after(mut self, starts: u32) -> Self {
        self.degraded_after = starts;
        self
    }

    pub fn with_min_healthy_uptime(mut self, uptime: Duration) -> Self {
        self.min_healthy_uptime = uptime;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_tag_requests(mut self, tag: bool) -> Self {
        self.tag_requests = tag;
        self
    }

    pub fn with_late_reply_grace(mut self, grace: Duration) -> Self {
        self.late_reply_grace = grace;
        self
    }

    /// Apply `{prefix}_*` overrides from the process environment.
    pub fn from_env(self, prefix: &str) -> Self {
        self.with_overrides(prefix, |key| std::env::var(key).ok())
    }

    /// Apply `{prefix}_*` overrides from an arbitrary lookup.
    pub fn with_overrides(mut self, prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |suffix: &str| -> Option<u64> {
            let key = format!("{prefix}_{suffix}");
            let raw = lookup(&key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(%key, value = %raw, error = %e, "Ignoring invalid override");
                    None
                }
            }
        };

        if let Some(ms) = read("RESTART_DELAY_MS") {
            self.restart_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = read("TIMEOUT_MS") {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = read("CACHE_CAPACITY") {
            self.cache_capacity = n as usize;
        }
        if let Some(secs) = read("COOLDOWN_SECS") {
            self.cooldown = Duration::from_secs(secs);
        }
        if let Some(ms) = read("LATE_REPLY_GRACE_MS") {
            self.late_reply_grace = Duration::from_millis(ms);
        }
        if let Some(n) = read("DEGRADED_AFTER") {
            self.degraded_after = u32::try_from(n).unwrap_or(u32::MAX);
        }
        self
    }
}

/// Where the helper scripts live and how to run them.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub python: String,
    pub services_dir: PathBuf,
    /// Groq key forwarded to the matching and translation helpers.
    pub api_key: Option<String>,
    pub matcher: BridgeConfig,
    pub translator: BridgeConfig,
    pub transcriber: BridgeConfig,
}

impl ServiceConfig {
    pub fn new(python: impl Into<String>, services_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            services_dir: services_dir.into(),
            api_key: None,
            matcher: BridgeConfig::new()
                .with_call_timeout(Duration::from_secs(15))
                .from_env("SARATHI_MATCHER"),
            translator: BridgeConfig::new()
                .with_call_timeout(Duration::from_secs(20))
                .from_env("SARATHI_TRANSLATOR"),
            transcriber: BridgeConfig::new()
                .with_call_timeout(Duration::from_secs(60))
                .with_cache_capacity(64)
                .from_env("SARATHI_TRANSCRIBER"),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.services_dir.join(name)
    }
}
