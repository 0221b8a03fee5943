//! sarathi-bridge: HTTP front for the matching, translation and
//! transcription helper processes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sarathi::config::ServiceConfig;
use sarathi::service::BridgeService;
use sarathi::transport::{ServerConfig, serve};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "sarathi-bridge")]
#[command(version)]
#[command(about = "Persistent worker bridges for the Digital Sarathi assistant")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "SARATHI_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 5001)]
    port: u16,

    /// Python interpreter used to run the helpers
    #[arg(long, env = "SARATHI_PYTHON", default_value = "python3")]
    python: String,

    /// Directory holding nlp_matcher.py, translator.py and transcriber.py
    #[arg(long, env = "SARATHI_SERVICES_DIR", default_value = "python_services")]
    services_dir: PathBuf,

    /// Groq API key forwarded to the matching and translation helpers
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Ignore SIGTERM and wait for POST /shutdown or SIGINT
    #[arg(long)]
    await_explicit_shutdown: bool,

    /// Bridge log level; RUST_LOG overrides it entirely
    #[arg(long, env = "SARATHI_LOG", default_value = "info")]
    log_level: LevelFilter,

    /// Level for helper stderr lines. Helpers echo user text there, so
    /// production deployments may want `warn`.
    #[arg(long, env = "SARATHI_WORKER_LOG", default_value = "info")]
    worker_log_level: LevelFilter,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Args {
    fn log_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some() {
            return EnvFilter::from_default_env();
        }
        EnvFilter::new(format!(
            "sarathi={level},sarathi_bridge={level},sarathi::worker={worker}",
            level = self.log_level,
            worker = self.worker_log_level,
        ))
    }
}

/// Logs go to stderr.
fn init_tracing(args: &Args) {
    let json = args.log_format == LogFormat::Json;
    let _ = tracing_subscriber::registry()
        .with(args.log_filter())
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = ServiceConfig::new(args.python, args.services_dir).with_api_key(args.api_key);
    if config.api_key.is_none() {
        tracing::warn!("No Groq API key configured; helpers will use their offline fallbacks");
    }

    let service = BridgeService::start(&config).context("failed to start worker bridges")?;
    tracing::info!(
        python = %config.python,
        services_dir = %config.services_dir.display(),
        "Worker bridges started"
    );

    serve(
        ServerConfig {
            host: args.host,
            port: args.port,
            await_explicit_shutdown: args.await_explicit_shutdown,
        },
        Arc::new(service),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_flags_parse() {
        let args = Args::try_parse_from([
            "sarathi-bridge",
            "--log-level",
            "debug",
            "--worker-log-level",
            "warn",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.log_level, LevelFilter::DEBUG);
        assert_eq!(args.worker_log_level, LevelFilter::WARN);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Args::try_parse_from(["sarathi-bridge", "--log-format", "xml"]).is_err());
    }
}
