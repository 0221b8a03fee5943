//! HTTP server lifecycle: bind, serve until told to stop, then stop the
//! helper processes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::service::{BridgeService, HealthSnapshot};

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            await_explicit_shutdown: false,
        }
    }
}

/// Serve the bridges until a stop signal, then shut every helper down.
pub async fn serve(config: ServerConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let stop = StopSignals::install(config.await_explicit_shutdown, service.shutdown_rx())?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "Sarathi bridge listening");
    log_bridges(&service.health());

    axum::serve(listener, routes(Arc::clone(&service)))
        .with_graceful_shutdown(async move {
            let reason = stop.wait().await;
            info!(?reason, "Stopping HTTP server");
        })
        .await?;

    let report = service.shutdown().await;
    for (bridge, resolved) in &report.resolved {
        if *resolved > 0 {
            warn!(bridge, resolved, "Calls still waiting at shutdown fell back");
        }
    }
    info!(resolved = report.total(), "Worker bridges stopped");

    Ok(())
}

fn log_bridges(snapshot: &HealthSnapshot) {
    for (bridge, health) in &snapshot.bridges {
        info!(bridge, status = %health.status, pid = ?health.pid, "Bridge up");
    }
    if !snapshot.is_ready() {
        warn!(status = %snapshot.status, "Serving before every bridge is ready");
    }
}

/// What ended the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupt,
    Terminate,
    Requested,
}

/// Stop triggers, installed before the listener binds so a failure to
/// register them aborts startup instead of panicking later.
struct StopSignals {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
    requested: watch::Receiver<bool>,
}

impl StopSignals {
    fn install(await_explicit_shutdown: bool, requested: watch::Receiver<bool>) -> anyhow::Result<Self> {
        #[cfg(unix)]
        let terminate = if await_explicit_shutdown {
            info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            None
        } else {
            use tokio::signal::unix::{SignalKind, signal};
            Some(signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?)
        };
        #[cfg(not(unix))]
        let _ = await_explicit_shutdown;

        Ok(Self {
            #[cfg(unix)]
            terminate,
            requested,
        })
    }

    async fn wait(self) -> StopReason {
        #[cfg(unix)]
        let mut sigterm = self.terminate;
        let mut requested = self.requested;

        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match sigterm.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let requested = async {
            // A dropped sender means nobody can request a stop anymore.
            if requested.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = interrupt => StopReason::Interrupt,
            _ = terminate => StopReason::Terminate,
            _ = requested => StopReason::Requested,
        }
    }
}
