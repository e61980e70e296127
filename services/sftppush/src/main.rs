use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sftppush::config::{Config, LogFormat, SourceConfig};
use sftppush::pipeline::{PipelineCoordinator, SessionConfig};
use sftppush::uploader::{ObjectStore, S3Uploader};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Archive completed SFTP uploads to S3.
///
/// Watches source directories for files whose writer has closed them,
/// decompresses gzip content and streams it to the configured bucket,
/// then removes the local file.
#[derive(Debug, Parser)]
#[command(name = "sftppush", version, about)]
struct Cli {
    /// Path to a config file (default locations are searched otherwise)
    #[arg(short, long, env = "SFTPPUSH_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start watching the configured source directories
    Watch {
        /// Source to watch, e.g. "name=user1,paths=/device1/data /device2/data".
        /// Replaces the sources from the config file when given.
        #[arg(short, long = "source")]
        sources: Vec<SourceConfig>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let Command::Watch { sources } = cli.command;
    if !sources.is_empty() {
        config.watch.source = sources;
    }

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting sftppush"
    );

    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let store: Arc<dyn ObjectStore> =
        Arc::new(S3Uploader::new(&config.defaults, config.upload.part_size_bytes).await);

    let root = config.destination_root()?;
    let shutdown = CancellationToken::new();

    // One session per configured source, all sharing the bucket
    let mut sessions = Vec::with_capacity(config.watch.source.len());
    for source in &config.watch.source {
        let session_config = SessionConfig {
            name: source.name.clone(),
            directories: source.paths.clone(),
            bucket: config.defaults.s3target.clone(),
            root: root.clone(),
            upload_timeout: config.upload_timeout(),
            upload_concurrency: config.upload.concurrency,
        };

        let running = PipelineCoordinator::new(session_config, store.clone())
            .start(shutdown.child_token())
            .with_context(|| format!("Failed to start watch session {}", source.name))?;

        sessions.push(running);
    }

    info!(sessions = sessions.len(), "sftppush started");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down, draining in-flight uploads");
    shutdown.cancel();

    for session in sessions {
        let name = session.name().to_string();
        match session.wait().await {
            Ok(summary) => info!(
                session = %name,
                files_removed = summary.files_removed,
                "Session drained"
            ),
            Err(e) => error!(session = %name, error = %e, "Session ended with error"),
        }
    }

    info!("sftppush stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_sources() {
        let cli = Cli::try_parse_from([
            "sftppush",
            "--config",
            "config.yaml",
            "watch",
            "--source",
            "name=user1,paths=/device1/data /device2/data",
            "--source",
            "name=user2,paths=/device3/data",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("config.yaml")));
        let Command::Watch { sources } = cli.command;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].name, "user2");
    }

    #[test]
    fn test_cli_rejects_malformed_source() {
        assert!(Cli::try_parse_from(["sftppush", "watch", "--source", "paths=/a"]).is_err());
    }
}
