//! Prometheus exporter for AdGuard Home.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use guardsight_exporter::config::{layered_lookup, read_dotenv};
use guardsight_exporter::logging::{init_tracing, parse_level};
use guardsight_exporter::{ExporterConfig, HttpServer, MetricRegistry, build_poller};

/// Prometheus exporter for AdGuard Home.
#[derive(Parser, Debug)]
#[command(name = "guardsight-exporter")]
#[command(about = "Export AdGuard Home statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config and EXPORTER_PORT).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,

    /// Dotenv file with environment defaults; ignored when absent.
    #[arg(long, default_value = ".env")]
    env_file: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    let mut warnings = Vec::new();
    let dotenv = read_dotenv(&args.env_file).unwrap_or_else(|e| {
        warnings.push(format!("Ignoring {}: {}", args.env_file, e));
        Default::default()
    });
    warnings.extend(config.apply_env(layered_lookup(|key| std::env::var(key).ok(), &dotenv)));

    // CLI overrides
    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }
    if let Some(level) = args.log_level {
        match parse_level(&level) {
            Some(level) => config.logging.level = level.to_string(),
            None => warnings.push(format!("Invalid --log-level {:?}, ignoring", level)),
        }
    }

    config.validate()?;

    init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    for warning in &warnings {
        warn!("{}", warning);
    }

    info!(
        appliance = %config.adguard.url,
        interval_secs = config.poll.interval_secs,
        "Starting GuardSight exporter"
    );

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(MetricRegistry::new());
    let mut poller = build_poller(&config, registry.clone())?;
    let poll_stats = poller.stats();

    // Bind before polling so a taken port fails fast.
    let http_server = HttpServer::bind(
        registry.clone(),
        poll_stats.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    )
    .await?;

    // First scrape should see data.
    let report = poller.poll_once().await;
    if report.all_succeeded() {
        info!(elapsed_ms = report.elapsed.as_millis() as u64, "Initial poll complete");
    } else {
        warn!(failed = ?report.failed, "Initial poll incomplete");
    }

    let mut poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal, or for the poller to die on its own
    let poller_exit = tokio::select! {
        result = &mut poller_task => {
            match &result {
                Ok(()) => error!("Poller stopped unexpectedly, shutting down..."),
                Err(e) => error!("Poller task failed: {}, shutting down...", e),
            }
            Some(result)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            None
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
            None
        }
    };

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        if poller_exit.is_none() {
            if let Err(e) = poller_task.await {
                error!("Poller task failed: {}", e);
            }
        }
        if let Err(e) = http_task.await {
            error!("HTTP task failed: {}", e);
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks did not stop within 5s");
    }

    let stats = poll_stats.read().clone();
    info!(
        cycles = stats.cycles_completed,
        fetches_succeeded = stats.fetches_succeeded,
        fetches_failed = stats.fetches_failed,
        series_count = registry.series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    match poller_exit {
        Some(Err(e)) => Err(anyhow::anyhow!("Poller task failed: {}", e)),
        Some(Ok(())) => Err(anyhow::anyhow!("Poller stopped before shutdown was requested")),
        None => Ok(()),
    }
}
