//! Bridge service: the three capability bridges behind one handle.
//!
//! Built once at startup and shared by `Arc` with every caller. Owns the
//! helper processes; [`BridgeService::shutdown`] stops all of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::breaker::BreakerSnapshot;
use crate::capability::{Matcher, Transcriber, Translator};
use crate::client::{BridgeClient, BridgeError, Capability};
use crate::config::ServiceConfig;
use crate::health::WorkerHealth;
use crate::spawner::CommandSpawner;
use crate::version::VersionInfo;

/// Point-in-time state of one bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub status: WorkerHealth,
    pub pid: Option<u32>,
    pub restarts: u64,
    pub cached: usize,
    pub breaker: BreakerSnapshot,
}

impl BridgeHealth {
    fn of<C: Capability>(client: &BridgeClient<C>) -> Self {
        Self {
            status: client.health(),
            pid: client.manager().pid(),
            restarts: client.manager().restarts(),
            cached: client.cache_len(),
            breaker: client.breaker_state(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: WorkerHealth,
    pub started_at: DateTime<Utc>,
    pub version: VersionInfo,
    pub bridges: IndexMap<&'static str, BridgeHealth>,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status.is_serving()
    }
}

/// Worst state across bridges; ready only when every bridge is ready.
fn overall(states: impl IntoIterator<Item = WorkerHealth>) -> WorkerHealth {
    fn rank(health: WorkerHealth) -> u8 {
        match health {
            WorkerHealth::Ready => 0,
            WorkerHealth::Unknown => 1,
            WorkerHealth::Starting => 2,
            WorkerHealth::Restarting => 3,
            WorkerHealth::Degraded => 4,
            WorkerHealth::Stopped => 5,
        }
    }
    states
        .into_iter()
        .max_by_key(|h| rank(*h))
        .unwrap_or_default()
}

/// Calls each bridge resolved to its fallback while stopping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub resolved: IndexMap<&'static str, usize>,
}

impl ShutdownReport {
    pub fn total(&self) -> usize {
        self.resolved.values().sum()
    }
}

pub struct BridgeService {
    matcher: BridgeClient<Matcher>,
    translator: BridgeClient<Translator>,
    transcriber: BridgeClient<Transcriber>,
    version: VersionInfo,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeService {
    /// Spawn the three helper scripts described by `config`.
    pub fn start(config: &ServiceConfig) -> Result<Self, BridgeError> {
        let helper = |script: &str| {
            Arc::new(CommandSpawner::python_script(&config.python, config.script(script)))
        };

        let matcher = BridgeClient::start(
            Matcher::new(config.api_key.clone()),
            helper("nlp_matcher.py"),
            config.matcher.clone(),
        )?;
        let translator = BridgeClient::start(
            Translator::new(config.api_key.clone()),
            helper("translator.py"),
            config.translator.clone(),
        )?;
        let transcriber = BridgeClient::start(
            Transcriber,
            helper("transcriber.py"),
            config.transcriber.clone(),
        )?;

        Ok(Self::new(matcher, translator, transcriber)
            .with_version(VersionInfo::new().with_python(config.python.clone())))
    }

    pub fn new(
        matcher: BridgeClient<Matcher>,
        translator: BridgeClient<Translator>,
        transcriber: BridgeClient<Transcriber>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            matcher,
            translator,
            transcriber,
            version: VersionInfo::new(),
            started_at: Utc::now(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn matcher(&self) -> &BridgeClient<Matcher> {
        &self.matcher
    }

    pub fn translator(&self) -> &BridgeClient<Translator> {
        &self.translator
    }

    pub fn transcriber(&self) -> &BridgeClient<Transcriber> {
        &self.transcriber
    }

    pub fn health(&self) -> HealthSnapshot {
        let mut bridges = IndexMap::new();
        bridges.insert(self.matcher.capability().name(), BridgeHealth::of(&self.matcher));
        bridges.insert(self.translator.capability().name(), BridgeHealth::of(&self.translator));
        bridges.insert(self.transcriber.capability().name(), BridgeHealth::of(&self.transcriber));

        HealthSnapshot {
            status: overall(bridges.values().map(|b| b.status)),
            started_at: self.started_at,
            version: self.version.clone(),
            bridges,
        }
    }

    /// Stop every helper process. Outstanding calls resolve to fallbacks.
    pub async fn shutdown(&self) -> ShutdownReport {
        let (matcher, translator, transcriber) = tokio::join!(
            self.matcher.shutdown(),
            self.translator.shutdown(),
            self.transcriber.shutdown(),
        );
        ShutdownReport {
            resolved: IndexMap::from([
                (self.matcher.capability().name(), matcher),
                (self.translator.capability().name(), translator),
                (self.transcriber.capability().name(), transcriber),
            ]),
        }
    }

    /// Ask the server to begin graceful shutdown.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::fake_service;
    use super::*;
    use crate::capability::TranslateInput;

    #[test]
    fn overall_is_the_worst_state() {
        assert_eq!(
            overall([WorkerHealth::Ready, WorkerHealth::Ready]),
            WorkerHealth::Ready
        );
        assert_eq!(
            overall([WorkerHealth::Ready, WorkerHealth::Degraded, WorkerHealth::Restarting]),
            WorkerHealth::Degraded
        );
        assert_eq!(overall([]), WorkerHealth::Unknown);
    }

    #[tokio::test]
    async fn health_lists_every_bridge() {
        let service = fake_service();
        let snapshot = service.health();

        assert!(snapshot.is_ready());
        assert_eq!(
            snapshot.bridges.keys().copied().collect::<Vec<_>>(),
            ["match", "translate", "transcribe"]
        );
        assert!(snapshot.bridges["translate"].pid.is_some());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_all_bridges() {
        let service = fake_service();
        service
            .translator()
            .call(TranslateInput::new("How are you", "ml"))
            .await;
        let report = service.shutdown().await;
        assert_eq!(
            report.resolved.keys().copied().collect::<Vec<_>>(),
            ["match", "translate", "transcribe"]
        );
        assert_eq!(report.total(), 0);
        assert_eq!(service.shutdown().await.total(), 0);

        let snapshot = service.health();
        assert_eq!(snapshot.status, WorkerHealth::Stopped);
        assert!(snapshot.bridges.values().all(|b| b.pid.is_none()));
        assert_eq!(snapshot.bridges["translate"].cached, 1);
    }

    #[tokio::test]
    async fn shutdown_signal_works() {
        let service = fake_service();
        let mut rx = service.shutdown_rx();
        assert!(!*rx.borrow());

        service.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        service.shutdown().await;
    }
}
