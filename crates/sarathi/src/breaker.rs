//! Cooldown breaker for upstream rate limiting.
//!
//! # States
//! - Closed: calls are dispatched to the worker
//! - Open: calls resolve to the fallback without touching the worker
//!
//! # Transitions
//! ```text
//! Closed → Open:   a rate-limit marker is seen in a reply error or on stderr
//! Open → Closed:   on the first check after `cooldown` has elapsed
//! ```
//!
//! There is no half-open trial call; recovery is purely time based. Signals
//! observed while already open do not extend the window.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerStatus {
    Closed,
    Open,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub status: BreakerStatus,
    /// Milliseconds until the breaker closes again (0 when closed).
    pub remaining_ms: u64,
    /// Number of times the breaker has tripped since the bridge started.
    pub trips: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    opened_at: Option<Instant>,
    trips: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cooldown: Duration,
    markers: Vec<String>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Markers are matched case-insensitively as substrings.
    pub fn new(cooldown: Duration, markers: &[String]) -> Self {
        Self {
            cooldown,
            markers: markers
                .iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // State is two plain fields; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True while the cooldown window is running. Closes the breaker once
    /// the window has elapsed.
    pub fn should_bypass(&self) -> bool {
        let mut state = self.lock();
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() < self.cooldown => true,
            Some(_) => {
                state.opened_at = None;
                tracing::info!("Breaker cooldown elapsed, resuming dispatch");
                false
            }
            None => false,
        }
    }

    pub fn is_rate_limit(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.markers.iter().any(|m| text.contains(m.as_str()))
    }

    /// Inspect an error/stderr text. Returns true if this call opened the breaker.
    pub fn record_signal(&self, text: &str) -> bool {
        if !self.is_rate_limit(text) {
            return false;
        }
        let mut state = self.lock();
        let already_open = state
            .opened_at
            .is_some_and(|opened_at| opened_at.elapsed() < self.cooldown);
        if already_open {
            return false;
        }
        state.opened_at = Some(Instant::now());
        state.trips += 1;
        tracing::warn!(
            cooldown_secs = self.cooldown.as_secs_f64(),
            signal = %text.trim(),
            "Upstream rate limited, opening breaker"
        );
        true
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        let remaining = state
            .opened_at
            .map(|opened_at| self.cooldown.saturating_sub(opened_at.elapsed()))
            .unwrap_or_default();
        BreakerSnapshot {
            status: if remaining.is_zero() {
                BreakerStatus::Closed
            } else {
                BreakerStatus::Open
            },
            remaining_ms: remaining.as_millis() as u64,
            trips: state.trips,
        }
    }
}
