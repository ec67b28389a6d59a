//! Prometheus exporter for AdGuard Home.
//!
//! Polls the appliance's control API on a fixed interval and republishes
//! its statistics over an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  AdGuard Home   │────>│ Poller          │────>│   HTTP Server   │
//! │  (/control/*)   │     │  + Reconciler   │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! ADGUARD_HOST=http://192.168.1.2:3000 ADGUARD_USER=admin ADGUARD_PASS=secret \
//!     guardsight-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod catalog;
pub mod config;
pub mod http;
pub mod logging;
pub mod mapping;
pub mod poller;
pub mod reconciler;
pub mod registry;

use std::time::Duration;

use guardsight_adguard::{AdGuardClient, Fetcher};

pub use catalog::{Catalog, Metric};
pub use config::ExporterConfig;
pub use http::HttpServer;
pub use poller::{CycleReport, PollStats, Poller, SharedPollStats};
pub use reconciler::Reconciler;
pub use registry::{MetricRegistry, SharedRegistry};

/// Wire a poller against the live appliance, registering every metric
/// family with `registry`.
pub fn build_poller(
    config: &ExporterConfig,
    registry: SharedRegistry,
) -> anyhow::Result<Poller<AdGuardClient>> {
    let catalog = Catalog::new(&config.prometheus.prefix);
    catalog.register(&registry)?;

    let reconciler = Reconciler::new(registry, catalog, config.querylog.dedupe);
    reconciler.prime()?;

    let client = AdGuardClient::new(config.adguard.clone())?;
    let fetcher = Fetcher::new(client, config.schema.clone());

    Ok(Poller::new(
        fetcher,
        reconciler,
        Duration::from_secs(config.poll.interval_secs),
    ))
}
