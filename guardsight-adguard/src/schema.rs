//! Versioned field mapping for appliance documents.
//!
//! AdGuard Home has renamed and restructured fields between releases
//! (`num_dns_queries` vs `dns_queries`, flat `dhcp_available` vs nested
//! `dhcp.enabled`, and so on). Instead of pinning one layout, each logical
//! field is located through an ordered list of JSON pointers and the first
//! one present in the document wins. The defaults cover every layout seen
//! so far; operators can override any field from the configuration file.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered JSON pointer candidates for one logical field.
///
/// Deserializes from a single string or a list of strings. Entries without
/// a leading `/` are treated as top-level keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany", into = "Vec<String>")]
pub struct FieldPaths(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for FieldPaths {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(path) => Self::new([path]),
            OneOrMany::Many(paths) => Self::new(paths),
        }
    }
}

impl From<FieldPaths> for Vec<String> {
    fn from(value: FieldPaths) -> Self {
        value.0
    }
}

impl FieldPaths {
    /// Build from pointer candidates, normalizing bare keys to pointers.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            paths
                .into_iter()
                .map(Into::into)
                .map(|p| if p.starts_with('/') { p } else { format!("/{}", p) })
                .collect(),
        )
    }

    /// Find the first candidate present (and not `null`) in `doc`.
    ///
    /// Returns the matching pointer together with the value.
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<(&str, &'a Value)> {
        self.0.iter().find_map(|path| match doc.pointer(path) {
            Some(Value::Null) | None => None,
            Some(value) => Some((path.as_str(), value)),
        })
    }

    /// Pointer candidates in priority order.
    pub fn candidates(&self) -> &[String] {
        &self.0
    }

    /// Primary pointer, used when reporting a missing field.
    pub fn primary(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("/")
    }
}

/// Unit a time-valued field is reported in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    /// Convert a raw value in this unit to seconds.
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            TimeUnit::Milliseconds => value / 1000.0,
            TimeUnit::Seconds => value,
        }
    }
}

/// Decoding rules for all three endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    pub stats: StatsSchema,
    pub status: StatusSchema,
    pub querylog: QueryLogSchema,
}

/// Field layout of `/control/stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSchema {
    pub dns_queries: FieldPaths,
    pub blocked_filtering: FieldPaths,
    pub replaced_parental: FieldPaths,
    pub replaced_safebrowsing: FieldPaths,
    pub replaced_safesearch: FieldPaths,
    pub avg_processing_time: FieldPaths,
    pub avg_processing_time_unit: TimeUnit,
    pub top_queried_domains: FieldPaths,
    pub top_blocked_domains: FieldPaths,
    pub top_clients: FieldPaths,
    pub top_upstreams_responses: FieldPaths,
    pub top_upstreams_avg_time: FieldPaths,
    pub top_upstreams_avg_time_unit: TimeUnit,
}

impl Default for StatsSchema {
    fn default() -> Self {
        Self {
            dns_queries: FieldPaths::new(["/num_dns_queries", "/dns_queries"]),
            blocked_filtering: FieldPaths::new(["/num_blocked_filtering", "/blocked_filtering"]),
            replaced_parental: FieldPaths::new(["/num_replaced_parental", "/replaced_parental"]),
            replaced_safebrowsing: FieldPaths::new([
                "/num_replaced_safebrowsing",
                "/replaced_safebrowsing",
            ]),
            replaced_safesearch: FieldPaths::new([
                "/num_replaced_safesearch",
                "/replaced_safesearch",
            ]),
            avg_processing_time: FieldPaths::new(["/avg_processing_time"]),
            avg_processing_time_unit: TimeUnit::Milliseconds,
            top_queried_domains: FieldPaths::new(["/top_queried_domains"]),
            top_blocked_domains: FieldPaths::new(["/top_blocked_domains"]),
            top_clients: FieldPaths::new(["/top_clients"]),
            top_upstreams_responses: FieldPaths::new([
                "/top_upstreams_responses",
                "/top_upstreams",
            ]),
            top_upstreams_avg_time: FieldPaths::new([
                "/top_upstreams_avg_time",
                "/top_upstream_avg_time",
            ]),
            top_upstreams_avg_time_unit: TimeUnit::Milliseconds,
        }
    }
}

/// Field layout of `/control/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSchema {
    pub running: FieldPaths,
    pub protection_enabled: FieldPaths,
    pub dhcp_enabled: FieldPaths,
    /// Either a lease array (its length is used) or a plain count.
    pub dhcp_leases: FieldPaths,
    pub protection_disabled_duration: FieldPaths,
    pub protection_disabled_duration_unit: TimeUnit,
    pub version: FieldPaths,
}

impl Default for StatusSchema {
    fn default() -> Self {
        Self {
            running: FieldPaths::new(["/running"]),
            protection_enabled: FieldPaths::new(["/protection_enabled"]),
            dhcp_enabled: FieldPaths::new(["/dhcp/enabled", "/dhcp_available"]),
            dhcp_leases: FieldPaths::new(["/dhcp/leases", "/dhcp_leases"]),
            protection_disabled_duration: FieldPaths::new(["/protection_disabled_duration"]),
            protection_disabled_duration_unit: TimeUnit::Milliseconds,
            version: FieldPaths::new(["/version"]),
        }
    }
}

/// Field layout of `/control/querylog`.
///
/// Entry fields are pointers relative to each entry object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLogSchema {
    pub entries: FieldPaths,
    pub name: FieldPaths,
    pub qtype: FieldPaths,
    pub client: FieldPaths,
    pub upstream: FieldPaths,
    pub reason: FieldPaths,
    pub elapsed: FieldPaths,
    pub elapsed_unit: TimeUnit,
    pub time: FieldPaths,
}

impl Default for QueryLogSchema {
    fn default() -> Self {
        Self {
            entries: FieldPaths::new(["/data"]),
            name: FieldPaths::new(["/question/name", "/QH"]),
            qtype: FieldPaths::new(["/question/type", "/QT"]),
            client: FieldPaths::new(["/client", "/IP"]),
            upstream: FieldPaths::new(["/upstream", "/Upstream"]),
            reason: FieldPaths::new(["/reason", "/Result/Reason"]),
            elapsed: FieldPaths::new(["/elapsedMs", "/elapsed_ms"]),
            elapsed_unit: TimeUnit::Milliseconds,
            time: FieldPaths::new(["/time", "/T"]),
        }
    }
}
