//! Harvest retrain command line entry point.
//!
//! `--run` executes the pipeline once, `--monitor` polls the object store
//! until interrupted.

use anyhow::{bail, Context, Result};
use clap::Parser;
use harvest_retrain::config::LoggingConfig;
use harvest_retrain::{
    Config, Monitor, PipelineOrchestrator, PipelineOutcome, RunCounter, S3ObjectStore,
    YoloCliBackend,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fetch, organize, train and export the crop detection model
#[derive(Debug, Parser)]
#[command(name = "harvest-retrain", version)]
struct Args {
    /// Start monitoring the object store for new data
    #[arg(long)]
    monitor: bool,

    /// Run the pipeline once
    #[arg(long)]
    run: bool,

    /// Path to test image for prediction
    #[arg(long, value_name = "PATH")]
    test_image: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Additional configuration file
    #[arg(long, value_name = "PATH", env = "RETRAIN_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.run && !args.monitor {
        println!("No action specified. Use --monitor or --run");
        println!("For help, use --help");
        return Ok(());
    }

    // Load configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging, args.debug)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Harvest retrain service"
    );

    config.validate().context("Invalid configuration")?;

    let paths = config.paths();
    paths
        .create_directories()
        .with_context(|| format!("Failed to create directories under {}", paths.data_dir.display()))?;

    // Initialize components
    let store = Arc::new(S3ObjectStore::new(&config.store));
    let backend = Arc::new(YoloCliBackend::new(&config.training, &paths));
    let pipeline = PipelineOrchestrator::new(&config, store, backend);

    if args.run {
        let outcome = pipeline
            .run_pipeline(args.test_image.as_deref())
            .await
            .context("Pipeline run failed")?;

        if let PipelineOutcome::Aborted { stage, reason } = outcome {
            bail!("Pipeline aborted while {}: {}", stage, reason);
        }
        return Ok(());
    }

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let monitor = Monitor::new(
        pipeline,
        RunCounter::new(&paths.counter_file),
        &config.monitor,
        args.test_image.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    monitor.run(shutdown).await;

    info!("Retrain service stopped");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig, debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let log_file = config.file.as_deref().map(open_log_file).transpose()?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json())
            .with(file_layer(log_file))
            .init();
    } else {
        registry
            .with(fmt::layer())
            .with(file_layer(log_file))
            .init();
    }

    Ok(())
}

/// Open the log file for appending, creating its directory.
fn open_log_file(path: &Path) -> Result<Arc<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok(Arc::new(file))
}

fn file_layer<S>(file: Option<Arc<File>>) -> Option<fmt::Layer<S, DefaultFields, Format, Arc<File>>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    file.map(|file| fmt::layer().with_ansi(false).with_writer(file))
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
