//! Translation of decoded appliance payloads into registry mutations.
//!
//! Each source is applied inside its own registry write transaction:
//! point-in-time gauges are overwritten, label-based gauge families are
//! replaced wholesale so entities that disappeared upstream disappear here
//! too, and query-log entries only ever increment counters.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use guardsight_adguard::{
    Endpoint, FetchError, QueryLogEntry, QueryLogPage, Stats, Status, TopEntry,
};
use tracing::{debug, trace};

use crate::catalog::{Catalog, Metric};
use crate::mapping::bool_to_value;
use crate::registry::{RegistryWriter, Result, SharedRegistry};

/// Error kinds pre-created at zero so `rate()` works before the first failure.
const ERROR_KINDS: [&str; 3] = ["transport", "status", "decode"];

/// Identity of a query-log entry among entries sharing one timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    client: String,
    name: String,
    qtype: String,
    reason: String,
}

impl From<&QueryLogEntry> for EntryKey {
    fn from(entry: &QueryLogEntry) -> Self {
        Self {
            client: entry.client.clone(),
            name: entry.name.clone(),
            qtype: entry.qtype.clone(),
            reason: entry.reason.clone(),
        }
    }
}

/// Applies payloads to a [`MetricRegistry`](crate::registry::MetricRegistry).
pub struct Reconciler {
    registry: SharedRegistry,
    catalog: Catalog,
    dedupe_querylog: bool,
    /// Newest query-log timestamp already counted.
    querylog_cursor: Option<DateTime<FixedOffset>>,
    /// Entries already counted at exactly `querylog_cursor`.
    counted_at_cursor: HashSet<EntryKey>,
}

impl Reconciler {
    /// Create a reconciler over an already-registered catalog.
    pub fn new(registry: SharedRegistry, catalog: Catalog, dedupe_querylog: bool) -> Self {
        Self {
            registry,
            catalog,
            dedupe_querylog,
            querylog_cursor: None,
            counted_at_cursor: HashSet::new(),
        }
    }

    /// Create the per-source error counters at zero.
    pub fn prime(&self) -> Result<()> {
        let mut w = self.registry.write();
        let name = self.catalog.name(Metric::FetchErrors);
        for endpoint in Endpoint::ALL {
            for kind in ERROR_KINDS {
                w.inc_counter(name, &[endpoint.as_str(), kind], 0.0)?;
            }
        }
        Ok(())
    }

    /// Apply aggregate statistics.
    pub fn apply_stats(&self, stats: &Stats) -> Result<()> {
        let c = &self.catalog;
        let mut w = self.registry.write();

        set_if_present(&mut w, c.name(Metric::DnsQueries), stats.dns_queries)?;
        set_if_present(&mut w, c.name(Metric::BlockedFiltering), stats.blocked_filtering)?;
        set_if_present(&mut w, c.name(Metric::ReplacedParental), stats.replaced_parental)?;
        set_if_present(
            &mut w,
            c.name(Metric::ReplacedSafebrowsing),
            stats.replaced_safebrowsing,
        )?;
        set_if_present(
            &mut w,
            c.name(Metric::ReplacedSafesearch),
            stats.replaced_safesearch,
        )?;
        set_if_present(
            &mut w,
            c.name(Metric::AvgProcessingTime),
            stats.avg_processing_time_secs,
        )?;

        replace_top(&mut w, c.name(Metric::TopQueriedDomains), &stats.top_queried_domains)?;
        replace_top(&mut w, c.name(Metric::TopBlockedDomains), &stats.top_blocked_domains)?;
        replace_top(&mut w, c.name(Metric::TopClients), &stats.top_clients)?;
        replace_top(&mut w, c.name(Metric::TopUpstreams), &stats.top_upstreams_responses)?;
        replace_top(
            &mut w,
            c.name(Metric::TopUpstreamAvgTime),
            &stats.top_upstreams_avg_time,
        )?;

        trace!(
            clients = stats.top_clients.len(),
            domains = stats.top_queried_domains.len(),
            "Applied stats"
        );
        Ok(())
    }

    /// Apply service status.
    pub fn apply_status(&self, status: &Status) -> Result<()> {
        let c = &self.catalog;
        let mut w = self.registry.write();

        set_if_present(&mut w, c.name(Metric::Running), status.running.map(bool_to_value))?;
        set_if_present(
            &mut w,
            c.name(Metric::ProtectionEnabled),
            status.protection_enabled.map(bool_to_value),
        )?;
        set_if_present(
            &mut w,
            c.name(Metric::DhcpAvailable),
            status.dhcp_enabled.map(bool_to_value),
        )?;
        set_if_present(
            &mut w,
            c.name(Metric::DhcpLeases),
            status.dhcp_leases.map(|n| n as f64),
        )?;
        set_if_present(
            &mut w,
            c.name(Metric::ProtectionDisabledDuration),
            status.protection_disabled_duration_secs,
        )?;

        let version = status.version.as_deref().map(|v| (vec![v], 1.0));
        w.replace_gauges(c.name(Metric::VersionInfo), version)?;

        Ok(())
    }

    /// Count the entries of a query-log page. Returns how many were counted.
    ///
    /// With de-duplication on, entries stamped before the newest timestamp
    /// seen on an earlier page are skipped. Entries stamped exactly at that
    /// timestamp are skipped only if the same client, domain, type and
    /// reason were already counted there. Entries without a timestamp are
    /// always counted.
    pub fn apply_querylog(&mut self, page: &QueryLogPage) -> Result<usize> {
        let c = &self.catalog;
        let cursor = if self.dedupe_querylog {
            self.querylog_cursor
        } else {
            None
        };

        let mut counted = 0usize;
        let mut stamped = Vec::new();
        {
            let mut w = self.registry.write();

            for entry in &page.entries {
                if let (Some(cursor), Some(time)) = (cursor, entry.time) {
                    if time < cursor
                        || (time == cursor
                            && self.counted_at_cursor.contains(&EntryKey::from(entry)))
                    {
                        continue;
                    }
                }
                if let Some(time) = entry.time {
                    stamped.push((time, EntryKey::from(entry)));
                }

                w.inc_counter(c.name(Metric::QueryReason), &[&entry.reason], 1.0)?;
                w.inc_counter(c.name(Metric::QueryType), &[&entry.qtype], 1.0)?;
                w.inc_counter(c.name(Metric::QueryUpstream), &[&entry.upstream], 1.0)?;
                w.inc_counter(c.name(Metric::QueryDomain), &[&entry.name], 1.0)?;
                w.inc_counter(
                    c.name(Metric::QueryClientReason),
                    &[&entry.client, &entry.reason],
                    1.0,
                )?;
                if let Some(elapsed) = entry.elapsed_secs.filter(|e| *e >= 0.0) {
                    w.observe(c.name(Metric::QueryElapsed), &[&entry.client], elapsed)?;
                }
                counted += 1;
            }

            w.inc_counter(c.name(Metric::QueryLogEntries), &[], counted as f64)?;
        }

        self.advance_cursor(stamped);
        debug!(
            page = page.entries.len(),
            counted,
            skipped = page.entries.len() - counted,
            "Applied query log"
        );
        Ok(counted)
    }

    fn advance_cursor(&mut self, stamped: Vec<(DateTime<FixedOffset>, EntryKey)>) {
        let Some(newest) = stamped.iter().map(|(time, _)| *time).max() else {
            return;
        };
        if self.querylog_cursor.is_none_or(|cursor| newest > cursor) {
            self.querylog_cursor = Some(newest);
            self.counted_at_cursor.clear();
        }
        let cursor = self.querylog_cursor;
        self.counted_at_cursor.extend(
            stamped
                .into_iter()
                .filter(|(time, _)| Some(*time) == cursor)
                .map(|(_, key)| key),
        );
    }

    /// Mark a source as successfully fetched.
    pub fn record_success(&self, endpoint: Endpoint) -> Result<()> {
        let c = &self.catalog;
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut w = self.registry.write();
        w.set_gauge(c.name(Metric::SourceUp), &[endpoint.as_str()], 1.0)?;
        w.set_gauge(c.name(Metric::LastSuccess), &[endpoint.as_str()], now)?;
        Ok(())
    }

    /// Count a failed fetch. The source's own series are left untouched.
    pub fn record_failure(&self, error: &FetchError) -> Result<()> {
        let c = &self.catalog;
        let source = error.endpoint().as_str();
        let mut w = self.registry.write();
        w.inc_counter(c.name(Metric::FetchErrors), &[source, error.kind()], 1.0)?;
        w.set_gauge(c.name(Metric::SourceUp), &[source], 0.0)?;
        Ok(())
    }

    /// Record the end of a poll cycle.
    pub fn record_cycle(&self, elapsed: Duration) -> Result<()> {
        let c = &self.catalog;
        let mut w = self.registry.write();
        w.set_gauge(c.name(Metric::PollDuration), &[], elapsed.as_secs_f64())?;
        w.inc_counter(c.name(Metric::Polls), &[], 1.0)?;
        Ok(())
    }

    /// Newest query-log timestamp counted so far.
    pub fn querylog_cursor(&self) -> Option<DateTime<FixedOffset>> {
        self.querylog_cursor
    }

    /// The catalog names are resolved against.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

fn set_if_present(w: &mut RegistryWriter<'_>, name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) => w.set_gauge(name, &[], v),
        None => Ok(()),
    }
}

fn replace_top(w: &mut RegistryWriter<'_>, name: &str, entries: &[TopEntry]) -> Result<()> {
    w.replace_gauges(
        name,
        entries.iter().map(|e| (vec![e.name.as_str()], e.value)),
    )
}
