//! The exported metric namespace.

use std::collections::HashMap;

use crate::mapping::{MetricKind, build_metric_name};
use crate::registry::{MetricDesc, MetricRegistry, Result};

/// Query elapsed-time buckets in seconds (1 ms, then every 5 ms up to 46 ms).
pub const ELAPSED_BUCKETS: [f64; 10] = [
    0.001, 0.006, 0.011, 0.016, 0.021, 0.026, 0.031, 0.036, 0.041, 0.046,
];

/// Every metric family the exporter publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    // Stats
    DnsQueries,
    BlockedFiltering,
    ReplacedParental,
    ReplacedSafebrowsing,
    ReplacedSafesearch,
    AvgProcessingTime,
    TopQueriedDomains,
    TopBlockedDomains,
    TopClients,
    TopUpstreams,
    TopUpstreamAvgTime,

    // Status
    Running,
    ProtectionEnabled,
    DhcpAvailable,
    DhcpLeases,
    ProtectionDisabledDuration,
    VersionInfo,

    // Query log
    QueryReason,
    QueryType,
    QueryUpstream,
    QueryDomain,
    QueryClientReason,
    QueryElapsed,

    // Exporter self-metrics
    SourceUp,
    FetchErrors,
    LastSuccess,
    PollDuration,
    Polls,
    QueryLogEntries,
}

impl Metric {
    pub const ALL: [Metric; 29] = [
        Metric::DnsQueries,
        Metric::BlockedFiltering,
        Metric::ReplacedParental,
        Metric::ReplacedSafebrowsing,
        Metric::ReplacedSafesearch,
        Metric::AvgProcessingTime,
        Metric::TopQueriedDomains,
        Metric::TopBlockedDomains,
        Metric::TopClients,
        Metric::TopUpstreams,
        Metric::TopUpstreamAvgTime,
        Metric::Running,
        Metric::ProtectionEnabled,
        Metric::DhcpAvailable,
        Metric::DhcpLeases,
        Metric::ProtectionDisabledDuration,
        Metric::VersionInfo,
        Metric::QueryReason,
        Metric::QueryType,
        Metric::QueryUpstream,
        Metric::QueryDomain,
        Metric::QueryClientReason,
        Metric::QueryElapsed,
        Metric::SourceUp,
        Metric::FetchErrors,
        Metric::LastSuccess,
        Metric::PollDuration,
        Metric::Polls,
        Metric::QueryLogEntries,
    ];

    /// Name without the configured prefix.
    pub fn suffix(self) -> &'static str {
        match self {
            Metric::DnsQueries => "dns_queries_total",
            Metric::BlockedFiltering => "blocked_filtering_total",
            Metric::ReplacedParental => "replaced_parental",
            Metric::ReplacedSafebrowsing => "replaced_safebrowsing",
            Metric::ReplacedSafesearch => "replaced_safesearch",
            Metric::AvgProcessingTime => "avg_processing_time_seconds",
            Metric::TopQueriedDomains => "top_queried_domain_total",
            Metric::TopBlockedDomains => "top_blocked_domain_total",
            Metric::TopClients => "top_client_total",
            Metric::TopUpstreams => "top_upstream_total",
            Metric::TopUpstreamAvgTime => "upstream_avg_response_time_seconds",
            Metric::Running => "running",
            Metric::ProtectionEnabled => "protection_enabled",
            Metric::DhcpAvailable => "dhcp_available",
            Metric::DhcpLeases => "dhcp_leases",
            Metric::ProtectionDisabledDuration => "protection_disabled_duration_seconds",
            Metric::VersionInfo => "version_info",
            Metric::QueryReason => "query_reason_total",
            Metric::QueryType => "query_type_total",
            Metric::QueryUpstream => "query_upstream_total",
            Metric::QueryDomain => "query_domain_total",
            Metric::QueryClientReason => "query_client_reason_total",
            Metric::QueryElapsed => "query_elapsed_seconds",
            Metric::SourceUp => "exporter_source_up",
            Metric::FetchErrors => "exporter_fetch_errors_total",
            Metric::LastSuccess => "exporter_last_success_timestamp_seconds",
            Metric::PollDuration => "exporter_poll_duration_seconds",
            Metric::Polls => "exporter_polls_total",
            Metric::QueryLogEntries => "exporter_querylog_entries_total",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Metric::DnsQueries => "Total DNS queries received",
            Metric::BlockedFiltering => "Total DNS queries blocked by filtering rules",
            Metric::ReplacedParental => "Total queries replaced by parental control",
            Metric::ReplacedSafebrowsing => "Total queries replaced by safe browsing",
            Metric::ReplacedSafesearch => "Total queries rewritten by safe search",
            Metric::AvgProcessingTime => "Average DNS query processing time",
            Metric::TopQueriedDomains => "Top queried domains",
            Metric::TopBlockedDomains => "Top blocked domains",
            Metric::TopClients => "Top clients by query count",
            Metric::TopUpstreams => "Top upstream servers by response count",
            Metric::TopUpstreamAvgTime => "Average response time per upstream server",
            Metric::Running => "Whether the DNS service is running (1/0)",
            Metric::ProtectionEnabled => "Whether filtering protection is enabled (1/0)",
            Metric::DhcpAvailable => "Whether the DHCP server is enabled (1/0)",
            Metric::DhcpLeases => "Number of active DHCP leases",
            Metric::ProtectionDisabledDuration => "Remaining time protection stays disabled",
            Metric::VersionInfo => "Appliance version, as a label",
            Metric::QueryReason => "Observed queries by filtering reason",
            Metric::QueryType => "Observed queries by DNS record type",
            Metric::QueryUpstream => "Observed queries by upstream server",
            Metric::QueryDomain => "Observed queries by domain",
            Metric::QueryClientReason => "Observed queries by client and filtering reason",
            Metric::QueryElapsed => "Query processing time by client",
            Metric::SourceUp => "Whether the last fetch of a source succeeded (1/0)",
            Metric::FetchErrors => "Failed fetches by source and error kind",
            Metric::LastSuccess => "Unix time of the last successful fetch of a source",
            Metric::PollDuration => "Duration of the last poll cycle",
            Metric::Polls => "Completed poll cycles",
            Metric::QueryLogEntries => "Query log entries counted",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            Metric::QueryReason
            | Metric::QueryType
            | Metric::QueryUpstream
            | Metric::QueryDomain
            | Metric::QueryClientReason
            | Metric::FetchErrors
            | Metric::Polls
            | Metric::QueryLogEntries => MetricKind::Counter,
            Metric::QueryElapsed => MetricKind::Histogram,
            _ => MetricKind::Gauge,
        }
    }

    pub fn label_names(self) -> &'static [&'static str] {
        match self {
            Metric::TopQueriedDomains | Metric::TopBlockedDomains | Metric::QueryDomain => {
                &["domain"]
            }
            Metric::TopClients | Metric::QueryElapsed => &["client"],
            Metric::TopUpstreams | Metric::TopUpstreamAvgTime | Metric::QueryUpstream => {
                &["upstream"]
            }
            Metric::VersionInfo => &["version"],
            Metric::QueryReason => &["reason"],
            Metric::QueryType => &["type"],
            Metric::QueryClientReason => &["client", "reason"],
            Metric::SourceUp | Metric::LastSuccess => &["source"],
            Metric::FetchErrors => &["source", "kind"],
            _ => &[],
        }
    }

    /// Full description under `prefix`.
    pub fn desc(self, prefix: &str) -> MetricDesc {
        let name = build_metric_name(prefix, self.suffix());
        match self.kind() {
            MetricKind::Histogram => {
                MetricDesc::histogram(name, self.help(), self.label_names(), &ELAPSED_BUCKETS)
            }
            kind => MetricDesc::new(name, self.help(), kind, self.label_names()),
        }
    }
}

/// Resolved metric names under one prefix.
#[derive(Debug, Clone)]
pub struct Catalog {
    prefix: String,
    names: HashMap<Metric, String>,
}

impl Catalog {
    /// Resolve every family name under `prefix`.
    pub fn new(prefix: &str) -> Self {
        let names = Metric::ALL
            .iter()
            .map(|m| (*m, build_metric_name(prefix, m.suffix())))
            .collect();
        Self {
            prefix: prefix.to_string(),
            names,
        }
    }

    /// The prefix every name is built under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full name of a family.
    pub fn name(&self, metric: Metric) -> &str {
        // Every variant is inserted in `new`.
        self.names.get(&metric).map(String::as_str).unwrap_or_default()
    }

    /// Register every family with `registry`.
    pub fn register(&self, registry: &MetricRegistry) -> Result<()> {
        for metric in Metric::ALL {
            registry.describe(metric.desc(&self.prefix))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique() {
        let suffixes: HashSet<_> = Metric::ALL.iter().map(|m| m.suffix()).collect();
        assert_eq!(suffixes.len(), Metric::ALL.len());
    }

    #[test]
    fn test_catalog_prefix() {
        let catalog = Catalog::new("adguard");
        assert_eq!(catalog.name(Metric::DnsQueries), "adguard_dns_queries_total");
        assert_eq!(
            catalog.name(Metric::FetchErrors),
            "adguard_exporter_fetch_errors_total"
        );
    }

    #[test]
    fn test_register_all() {
        let registry = MetricRegistry::new();
        let catalog = Catalog::new("adguard");
        catalog.register(&registry).unwrap();

        assert_eq!(registry.family_count(), Metric::ALL.len());
        // Registering twice is harmless.
        catalog.register(&registry).unwrap();
    }

    #[test]
    fn test_registered_names_follow_prefix() {
        let registry = MetricRegistry::new();
        let catalog = Catalog::new("home_dns");
        catalog.register(&registry).unwrap();
        registry
            .set_gauge(catalog.name(Metric::Running), &[], 1.0)
            .unwrap();

        assert_eq!(catalog.prefix(), "home_dns");
        assert_eq!(registry.value("home_dns_running", &[]), Some(1.0));
        assert_eq!(registry.value("adguard_running", &[]), None);
        for metric in Metric::ALL {
            assert_eq!(metric.desc(catalog.prefix()).name, catalog.name(metric));
        }
    }

    #[test]
    fn test_counters_end_in_total() {
        for metric in Metric::ALL {
            if metric.kind() == MetricKind::Counter {
                assert!(metric.suffix().ends_with("_total"), "{:?}", metric);
            }
        }
    }

    #[test]
    fn test_elapsed_buckets_match_histogram() {
        let desc = Metric::QueryElapsed.desc("adguard");
        assert_eq!(desc.kind, MetricKind::Histogram);
        assert_eq!(desc.buckets, ELAPSED_BUCKETS.to_vec());
    }
}
