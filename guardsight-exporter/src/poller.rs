//! Periodic polling of the appliance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use guardsight_adguard::{ApplianceApi, Endpoint, FetchError, Fetcher};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconciler;
use crate::registry;

/// Poll loop statistics.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    /// Completed poll cycles.
    pub cycles_completed: u64,
    /// Source fetches that succeeded.
    pub fetches_succeeded: u64,
    /// Source fetches that failed.
    pub fetches_failed: u64,
    /// Wall-clock end of the last cycle.
    pub last_cycle: Option<DateTime<Utc>>,
}

/// Poll statistics shared with the HTTP server.
pub type SharedPollStats = Arc<RwLock<PollStats>>;

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub succeeded: Vec<Endpoint>,
    pub failed: Vec<Endpoint>,
    pub elapsed: Duration,
}

impl CycleReport {
    /// Whether every source was fetched and applied.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fetches every source each interval and feeds the results to a [`Reconciler`].
pub struct Poller<A> {
    fetcher: Fetcher<A>,
    reconciler: Reconciler,
    interval: Duration,
    stats: SharedPollStats,
}

impl<A: ApplianceApi> Poller<A> {
    /// Create a poller.
    pub fn new(fetcher: Fetcher<A>, reconciler: Reconciler, interval: Duration) -> Self {
        Self {
            fetcher,
            reconciler,
            interval,
            stats: Arc::new(RwLock::new(PollStats::default())),
        }
    }

    /// Handle to the poll statistics.
    pub fn stats(&self) -> SharedPollStats {
        self.stats.clone()
    }

    /// The configured interval between cycles.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one cycle: fetch all sources concurrently, then reconcile each
    /// one independently.
    pub async fn poll_once(&mut self) -> CycleReport {
        let started = Instant::now();

        let (stats, status, querylog) = tokio::join!(
            self.fetcher.fetch_stats(),
            self.fetcher.fetch_status(),
            self.fetcher.fetch_querylog(),
        );

        let mut report = CycleReport::default();
        let outcomes = [
            (
                Endpoint::Stats,
                self.settle(Endpoint::Stats, stats, |r, p| r.apply_stats(&p)),
            ),
            (
                Endpoint::Status,
                self.settle(Endpoint::Status, status, |r, p| r.apply_status(&p)),
            ),
            (
                Endpoint::QueryLog,
                self.settle(Endpoint::QueryLog, querylog, |r, p| {
                    r.apply_querylog(&p).map(|_| ())
                }),
            ),
        ];
        for (endpoint, ok) in outcomes {
            if ok {
                report.succeeded.push(endpoint);
            } else {
                report.failed.push(endpoint);
            }
        }

        report.elapsed = started.elapsed();
        if let Err(e) = self.reconciler.record_cycle(report.elapsed) {
            error!(error = %e, "Failed to record poll cycle");
        }

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.fetches_succeeded += report.succeeded.len() as u64;
            stats.fetches_failed += report.failed.len() as u64;
            stats.last_cycle = Some(Utc::now());
        }

        debug!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Poll cycle complete"
        );
        report
    }

    /// Apply one fetch result. Returns whether the source is up.
    fn settle<T>(
        &mut self,
        endpoint: Endpoint,
        fetched: Result<T, FetchError>,
        apply: impl FnOnce(&mut Reconciler, T) -> registry::Result<()>,
    ) -> bool {
        let outcome = match fetched {
            Ok(payload) => apply(&mut self.reconciler, payload)
                .and_then(|()| self.reconciler.record_success(endpoint))
                .map(|()| true),
            Err(e) => {
                warn!(
                    source = %endpoint,
                    kind = e.kind(),
                    error = %e,
                    "Fetch failed"
                );
                self.reconciler.record_failure(&e).map(|()| false)
            }
        };

        outcome.unwrap_or_else(|e| {
            error!(source = %endpoint, error = %e, "Failed to update registry");
            false
        })
    }

    /// Poll every interval until shutdown is signalled.
    ///
    /// The first tick is one interval from now; callers run the initial
    /// cycle themselves with [`poll_once`](Self::poll_once). A cycle that
    /// overruns the interval delays the next one rather than bursting.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Starting poller");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            cycles = self.stats.read().cycles_completed,
            "Poller stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::registry::{MetricRegistry, SharedRegistry};
    use guardsight_adguard::Schema;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Reply {
        Json(Value),
        Unavailable,
        Malformed,
    }

    /// In-memory appliance with per-endpoint canned replies. Clones share state.
    #[derive(Clone, Default)]
    struct MockApi {
        replies: Arc<Mutex<HashMap<Endpoint, Reply>>>,
        calls: Arc<AtomicUsize>,
    }

    impl MockApi {
        fn set(&self, endpoint: Endpoint, reply: Reply) {
            self.replies.lock().unwrap().insert(endpoint, reply);
        }
    }

    impl ApplianceApi for MockApi {
        async fn get_json(&self, endpoint: Endpoint) -> guardsight_adguard::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().get(&endpoint).cloned();
            match reply {
                Some(Reply::Json(v)) => Ok(v),
                Some(Reply::Unavailable) | None => Err(FetchError::Status {
                    endpoint,
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                }),
                Some(Reply::Malformed) => {
                    let source = serde_json::from_str::<Value>("{\"running\":").unwrap_err();
                    Err(FetchError::Decode { endpoint, source })
                }
            }
        }
    }

    fn healthy() -> MockApi {
        let api = MockApi::default();
        api.set(
            Endpoint::Stats,
            Reply::Json(json!({"num_dns_queries": 100, "top_clients": [{"10.0.0.5": 42}]})),
        );
        api.set(
            Endpoint::Status,
            Reply::Json(json!({"running": true, "protection_enabled": true, "version": "v0.107.43"})),
        );
        api.set(
            Endpoint::QueryLog,
            Reply::Json(json!({"data": [{
                "question": {"name": "example.com", "type": "A"},
                "client": "10.0.0.5",
                "reason": "NotFilteredNotFound",
                "elapsedMs": "0.5",
                "time": "2024-05-01T10:00:00Z"
            }]})),
        );
        api
    }

    fn poller(api: MockApi) -> (SharedRegistry, Poller<MockApi>) {
        let registry = Arc::new(MetricRegistry::new());
        let catalog = Catalog::new("adguard");
        catalog.register(&registry).unwrap();
        let reconciler = Reconciler::new(registry.clone(), catalog, true);
        reconciler.prime().unwrap();
        let poller = Poller::new(
            Fetcher::new(api, Schema::default()),
            reconciler,
            Duration::from_secs(15),
        );
        (registry, poller)
    }

    #[tokio::test]
    async fn test_poll_once_all_sources() {
        let (registry, mut poller) = poller(healthy());

        let report = poller.poll_once().await;

        assert!(report.all_succeeded());
        assert_eq!(report.succeeded.len(), 3);
        assert_eq!(registry.value("adguard_dns_queries_total", &[]), Some(100.0));
        assert_eq!(registry.value("adguard_running", &[]), Some(1.0));
        assert_eq!(
            registry.value("adguard_query_reason_total", &["NotFilteredNotFound"]),
            Some(1.0)
        );
        for source in ["stats", "status", "querylog"] {
            assert_eq!(
                registry.value("adguard_exporter_source_up", &[source]),
                Some(1.0)
            );
        }
        assert_eq!(registry.value("adguard_exporter_polls_total", &[]), Some(1.0));
        assert_eq!(poller.stats().read().cycles_completed, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let api = healthy();
        let (registry, mut poller) = poller(api.clone());
        poller.poll_once().await;

        api.set(Endpoint::Status, Reply::Unavailable);
        api.set(
            Endpoint::Stats,
            Reply::Json(json!({"num_dns_queries": 120, "top_clients": [{"10.0.0.6": 7}]})),
        );
        let report = poller.poll_once().await;

        assert_eq!(report.failed, vec![Endpoint::Status]);
        // Stats still refreshed.
        assert_eq!(registry.value("adguard_dns_queries_total", &[]), Some(120.0));
        assert_eq!(registry.series("adguard_top_client_total").len(), 1);
        // Status series keep their last values.
        assert_eq!(registry.value("adguard_running", &[]), Some(1.0));
        assert_eq!(
            registry.value("adguard_exporter_fetch_errors_total", &["status", "status"]),
            Some(1.0)
        );
        assert_eq!(
            registry.value("adguard_exporter_source_up", &["status"]),
            Some(0.0)
        );
        assert_eq!(poller.stats().read().fetches_failed, 1);
    }

    #[tokio::test]
    async fn test_malformed_body_counts_decode_error() {
        let api = healthy();
        api.set(Endpoint::Status, Reply::Malformed);
        let (registry, mut poller) = poller(api);

        poller.poll_once().await;

        assert_eq!(
            registry.value("adguard_exporter_fetch_errors_total", &["status", "decode"]),
            Some(1.0)
        );
        assert_eq!(registry.value("adguard_running", &[]), None);
    }

    #[tokio::test]
    async fn test_counters_survive_failed_cycles() {
        let api = healthy();
        let (registry, mut poller) = poller(api.clone());
        poller.poll_once().await;

        api.set(Endpoint::QueryLog, Reply::Unavailable);
        poller.poll_once().await;
        poller.poll_once().await;

        assert_eq!(
            registry.value("adguard_query_reason_total", &["NotFilteredNotFound"]),
            Some(1.0)
        );
        assert_eq!(
            registry.value("adguard_exporter_fetch_errors_total", &["querylog", "status"]),
            Some(2.0)
        );
        assert_eq!(registry.value("adguard_exporter_polls_total", &[]), Some(3.0));
    }

    #[tokio::test]
    async fn test_repeated_page_is_not_double_counted() {
        let (registry, mut poller) = poller(healthy());

        poller.poll_once().await;
        poller.poll_once().await;

        assert_eq!(
            registry.value("adguard_exporter_querylog_entries_total", &[]),
            Some(1.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_each_interval_until_shutdown() {
        let api = healthy();
        let (_registry, poller) = poller(api.clone());
        let stats = poller.stats();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(poller.run(rx));

        // Nothing before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(stats.read().cycles_completed, 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(stats.read().cycles_completed, 2);
        assert_eq!(api.calls.load(Ordering::SeqCst), 6);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
