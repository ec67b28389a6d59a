//! AdGuard Home control API client for GuardSight.
//!
//! This crate covers the appliance side of the exporter:
//!
//! - [`client`] - HTTP fetchers with Basic auth and a bounded timeout
//! - [`schema`] - Versioned, configurable JSON field mapping
//! - [`payload`] - Decoded per-poll documents (stats, status, query log)
//! - [`error`] - The fetch error taxonomy
//!
//! # Example
//!
//! ```ignore
//! use guardsight_adguard::{AdGuardClient, ApplianceConfig, Fetcher, Schema};
//!
//! let client = AdGuardClient::new(ApplianceConfig::default())?;
//! let fetcher = Fetcher::new(client, Schema::default());
//! let stats = fetcher.fetch_stats().await?;
//! ```

pub mod client;
pub mod error;
pub mod payload;
pub mod schema;

pub use client::{AdGuardClient, ApplianceApi, ApplianceConfig, Endpoint, EndpointPaths, Fetcher};
pub use error::{FetchError, Result};
pub use payload::{QueryLogEntry, QueryLogPage, Stats, Status, TopEntry};
pub use schema::{FieldPaths, QueryLogSchema, Schema, StatsSchema, StatusSchema, TimeUnit};
