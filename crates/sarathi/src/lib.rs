//! sarathi: persistent worker bridges.
//!
//! A bridge keeps one long-running helper process alive and drives it over
//! newline-delimited JSON on stdin/stdout. Concurrent callers are correlated
//! to replies, successful results are cached, upstream rate limiting trips a
//! cooldown breaker, and a crashed helper is restarted. Callers never see
//! runtime errors; they get a capability-specific fallback instead.

mod health;
mod version;

pub mod breaker;
pub mod bridge;
pub mod cache;
pub mod capability;
pub mod channel;
pub mod client;
pub mod config;
pub mod language;
pub mod manager;
pub mod service;
pub mod spawner;
pub mod transport;

pub use breaker::{BreakerSnapshot, BreakerStatus, CircuitBreaker};
pub use cache::{CacheKey, ResponseCache};
pub use client::{
    BridgeClient, BridgeError, Capability, FallbackReason, InvalidInput, Resolution, Source,
    UpstreamError,
};
pub use config::{BridgeConfig, ServiceConfig};
pub use health::WorkerHealth;
pub use manager::WorkerProcessManager;
pub use service::{BridgeHealth, BridgeService, HealthSnapshot, ShutdownReport};
pub use spawner::{CommandSpawner, SpawnError, WorkerSpawner};
pub use version::{SARATHI_VERSION, VersionInfo};
