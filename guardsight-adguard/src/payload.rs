//! Decoded appliance documents.
//!
//! Payloads are transient: built once per poll from the raw JSON and the
//! [`Schema`](crate::schema::Schema), then dropped after reconciliation.
//! Time-valued fields are normalized to seconds here.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tracing::debug;

use crate::client::Endpoint;
use crate::error::{FetchError, Result};
use crate::schema::{FieldPaths, QueryLogSchema, StatsSchema, StatusSchema, TimeUnit};

/// Label used when a query-log entry lacks a string field.
pub const UNKNOWN: &str = "unknown";

/// One entry of a top-N breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct TopEntry {
    pub name: String,
    pub value: f64,
}

impl TopEntry {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Aggregate statistics.
///
/// Scalars are `None` when the document does not carry them; top-N lists
/// are empty in that case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub dns_queries: Option<f64>,
    pub blocked_filtering: Option<f64>,
    pub replaced_parental: Option<f64>,
    pub replaced_safebrowsing: Option<f64>,
    pub replaced_safesearch: Option<f64>,
    pub avg_processing_time_secs: Option<f64>,
    pub top_queried_domains: Vec<TopEntry>,
    pub top_blocked_domains: Vec<TopEntry>,
    pub top_clients: Vec<TopEntry>,
    pub top_upstreams_responses: Vec<TopEntry>,
    /// Average upstream response time, in seconds.
    pub top_upstreams_avg_time: Vec<TopEntry>,
}

/// Service status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub running: Option<bool>,
    pub protection_enabled: Option<bool>,
    pub dhcp_enabled: Option<bool>,
    pub dhcp_leases: Option<u64>,
    pub protection_disabled_duration_secs: Option<f64>,
    pub version: Option<String>,
}

/// One resolved (or blocked) DNS query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    pub name: String,
    pub qtype: String,
    pub client: String,
    pub upstream: String,
    pub reason: String,
    pub elapsed_secs: Option<f64>,
    pub time: Option<DateTime<FixedOffset>>,
}

/// The most recent page of the query log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryLogPage {
    pub entries: Vec<QueryLogEntry>,
}

/// Field accessor bound to one document.
struct Fields<'a> {
    endpoint: Endpoint,
    doc: &'a Value,
}

impl<'a> Fields<'a> {
    fn new(endpoint: Endpoint, doc: &'a Value) -> Result<Self> {
        if !doc.is_object() {
            return Err(FetchError::shape(endpoint, "/", "object"));
        }
        Ok(Self { endpoint, doc })
    }

    fn number(&self, paths: &FieldPaths) -> Result<Option<f64>> {
        match paths.resolve(self.doc) {
            None => Ok(None),
            Some((path, value)) => as_number(value)
                .map(Some)
                .ok_or_else(|| FetchError::shape(self.endpoint, path, "number")),
        }
    }

    fn seconds(&self, paths: &FieldPaths, unit: TimeUnit) -> Result<Option<f64>> {
        Ok(self.number(paths)?.map(|v| unit.to_seconds(v)))
    }

    fn flag(&self, paths: &FieldPaths) -> Result<Option<bool>> {
        match paths.resolve(self.doc) {
            None => Ok(None),
            Some((_, Value::Bool(b))) => Ok(Some(*b)),
            Some((path, _)) => Err(FetchError::shape(self.endpoint, path, "boolean")),
        }
    }

    fn text(&self, paths: &FieldPaths) -> Result<Option<String>> {
        match paths.resolve(self.doc) {
            None => Ok(None),
            Some((_, Value::String(s))) => Ok(Some(s.clone())),
            Some((_, Value::Number(n))) => Ok(Some(n.to_string())),
            Some((path, _)) => Err(FetchError::shape(self.endpoint, path, "string")),
        }
    }

    fn count(&self, paths: &FieldPaths) -> Result<Option<u64>> {
        match paths.resolve(self.doc) {
            None => Ok(None),
            Some((_, Value::Array(items))) => Ok(Some(items.len() as u64)),
            Some((path, value)) => match as_number(value) {
                Some(n) if n >= 0.0 => Ok(Some(n as u64)),
                _ => Err(FetchError::shape(
                    self.endpoint,
                    path,
                    "array or non-negative number",
                )),
            },
        }
    }

    /// A list of single-entry `{name: number}` objects. Every key of every
    /// object is taken.
    fn top_list(&self, paths: &FieldPaths, unit: Option<TimeUnit>) -> Result<Vec<TopEntry>> {
        const EXPECTED: &str = "array of {name: number} objects";

        let Some((path, value)) = paths.resolve(self.doc) else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            return Err(FetchError::shape(self.endpoint, path, EXPECTED));
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Value::Object(map) = item else {
                return Err(FetchError::shape(self.endpoint, path, EXPECTED));
            };
            for (name, raw) in map {
                let value = as_number(raw)
                    .ok_or_else(|| FetchError::shape(self.endpoint, path, EXPECTED))?;
                let value = unit.map_or(value, |u| u.to_seconds(value));
                entries.push(TopEntry::new(name.clone(), value));
            }
        }

        Ok(entries)
    }
}

/// Numbers may arrive as JSON numbers or numeric strings (`"elapsedMs": "0.42"`).
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Stats {
    /// Decode a `/control/stats` document.
    pub fn decode(doc: &Value, schema: &StatsSchema) -> Result<Self> {
        let f = Fields::new(Endpoint::Stats, doc)?;

        Ok(Self {
            dns_queries: f.number(&schema.dns_queries)?,
            blocked_filtering: f.number(&schema.blocked_filtering)?,
            replaced_parental: f.number(&schema.replaced_parental)?,
            replaced_safebrowsing: f.number(&schema.replaced_safebrowsing)?,
            replaced_safesearch: f.number(&schema.replaced_safesearch)?,
            avg_processing_time_secs: f.seconds(
                &schema.avg_processing_time,
                schema.avg_processing_time_unit,
            )?,
            top_queried_domains: f.top_list(&schema.top_queried_domains, None)?,
            top_blocked_domains: f.top_list(&schema.top_blocked_domains, None)?,
            top_clients: f.top_list(&schema.top_clients, None)?,
            top_upstreams_responses: f.top_list(&schema.top_upstreams_responses, None)?,
            top_upstreams_avg_time: f.top_list(
                &schema.top_upstreams_avg_time,
                Some(schema.top_upstreams_avg_time_unit),
            )?,
        })
    }
}

impl Status {
    /// Decode a `/control/status` document.
    pub fn decode(doc: &Value, schema: &StatusSchema) -> Result<Self> {
        let f = Fields::new(Endpoint::Status, doc)?;

        Ok(Self {
            running: f.flag(&schema.running)?,
            protection_enabled: f.flag(&schema.protection_enabled)?,
            dhcp_enabled: f.flag(&schema.dhcp_enabled)?,
            dhcp_leases: f.count(&schema.dhcp_leases)?,
            protection_disabled_duration_secs: f.seconds(
                &schema.protection_disabled_duration,
                schema.protection_disabled_duration_unit,
            )?,
            version: f.text(&schema.version)?,
        })
    }
}

impl QueryLogPage {
    /// Decode a `/control/querylog` document.
    pub fn decode(doc: &Value, schema: &QueryLogSchema) -> Result<Self> {
        let endpoint = Endpoint::QueryLog;
        let f = Fields::new(endpoint, doc)?;

        let Some((path, Value::Array(items))) = schema.entries.resolve(f.doc) else {
            return Err(FetchError::shape(
                endpoint,
                schema.entries.primary(),
                "array of entries",
            ));
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let entry = Fields::new(endpoint, item)
                .map_err(|_| FetchError::shape(endpoint, path, "array of entry objects"))?;
            entries.push(QueryLogEntry::decode(&entry, schema)?);
        }

        Ok(Self { entries })
    }

    /// Number of entries on the page.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the page is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl QueryLogEntry {
    fn decode(f: &Fields<'_>, schema: &QueryLogSchema) -> Result<Self> {
        let label = |paths: &FieldPaths| -> Result<String> {
            Ok(f.text(paths)?
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string()))
        };

        let time = match f.text(&schema.time)? {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(t) => Some(t),
                Err(e) => {
                    debug!(time = %raw, error = %e, "Ignoring unparseable query log timestamp");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            name: label(&schema.name)?,
            qtype: label(&schema.qtype)?,
            client: label(&schema.client)?,
            upstream: label(&schema.upstream)?,
            reason: label(&schema.reason)?,
            elapsed_secs: f.seconds(&schema.elapsed, schema.elapsed_unit)?,
            time,
        })
    }
}
