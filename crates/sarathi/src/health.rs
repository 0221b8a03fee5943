//! Health status of a worker bridge.

use serde::{Deserialize, Serialize};

/// Lifecycle of the worker behind a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerHealth {
    /// Not started yet
    #[default]
    Unknown,
    /// Process spawned, stdin not yet handed to the writer
    Starting,
    /// Accepting requests
    Ready,
    /// Worker exited; replacement scheduled
    Restarting,
    /// Worker keeps dying right after start; calls resolve to fallback
    Degraded,
    /// Shut down on request
    Stopped,
}

impl WorkerHealth {
    /// Whether requests are currently written to a live worker.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
