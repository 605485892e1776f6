use crate::engine::snapshot::{PoolGauges, create_snapshot};
use crate::engine::Stats;
use crate::types::{MetricsSnapshot, RequestOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared sink for request outcomes.
///
/// `record` is one short critical section around the histogram update, so
/// each outcome lands exactly once no matter how many tasks record at once.
pub struct MetricsCollector {
    stats: Mutex<Stats>,
    recorded: AtomicU64,
    max_requests: u64,
    limit_token: Option<CancellationToken>,
}

impl MetricsCollector {
    pub fn new(start_time: Instant, duration: Duration) -> Self {
        Self {
            stats: Mutex::new(Stats::new(start_time, duration)),
            recorded: AtomicU64::new(0),
            max_requests: 0,
            limit_token: None,
        }
    }

    /// Cancel `token` once `max_requests` outcomes were recorded (0 = never).
    pub fn with_limit(mut self, max_requests: u64, token: CancellationToken) -> Self {
        if max_requests > 0 {
            self.max_requests = max_requests;
            self.limit_token = Some(token);
        }
        self
    }

    pub fn record(&self, outcome: RequestOutcome) {
        self.stats.lock().record(&outcome);
        let recorded = self.recorded.fetch_add(1, Ordering::AcqRel) + 1;

        if recorded == self.max_requests
            && let Some(token) = &self.limit_token
        {
            tracing::info!("Max requests ({}) reached, stopping", self.max_requests);
            token.cancel();
        }
    }

    /// An emission got in only after waiting `waited` for pool room.
    pub fn record_backpressure(&self, waited: Duration) {
        self.stats.lock().record_backpressure(waited);
    }

    /// Emissions that came due but never entered the pool. They are not
    /// outcomes and do not count toward `max_requests`.
    pub fn record_unadmitted(&self, count: u64, waited: Duration) {
        if count > 0 || !waited.is_zero() {
            self.stats.lock().record_unadmitted(count, waited);
        }
    }

    /// Fix the end of the measured window. Throughput is computed over
    /// `[start, at)` even if completions keep arriving while draining.
    pub fn close_window(&self, at: Instant) {
        self.stats.lock().close_window(at);
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_with(PoolGauges::default())
    }

    pub fn snapshot_with(&self, gauges: PoolGauges) -> MetricsSnapshot {
        let stats = self.stats.lock();
        create_snapshot(&stats, gauges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, ErrorKind};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_records_are_never_lost() {
        let collector = Arc::new(MetricsCollector::new(Instant::now(), Duration::from_secs(60)));
        let endpoint = Endpoint::get("http://localhost/predict");

        let mut handles = Vec::new();
        for task in 0..64u64 {
            let collector = collector.clone();
            let endpoint = endpoint.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..500u64 {
                    let outcome = if (task + i) % 10 == 0 {
                        RequestOutcome::failure(endpoint.clone(), Instant::now(), Duration::from_micros(i), ErrorKind::Reset)
                    } else {
                        RequestOutcome::success(endpoint.clone(), Instant::now(), Duration::from_micros(i), Some(200))
                    };
                    collector.record(outcome);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total, 64 * 500);
        assert_eq!(snapshot.successful + snapshot.failed, 64 * 500);
        assert_eq!(snapshot.errors.get(&ErrorKind::Reset), Some(&(64 * 50)));
        assert_eq!(collector.recorded(), 64 * 500);
    }

    #[tokio::test]
    async fn limit_cancels_once() {
        let token = CancellationToken::new();
        let collector =
            MetricsCollector::new(Instant::now(), Duration::from_secs(1)).with_limit(3, token.clone());
        let endpoint = Endpoint::get("http://localhost/");

        for _ in 0..2 {
            collector.record(RequestOutcome::success(endpoint.clone(), Instant::now(), Duration::ZERO, Some(200)));
        }
        assert!(!token.is_cancelled());

        collector.record(RequestOutcome::success(endpoint.clone(), Instant::now(), Duration::ZERO, Some(200)));
        assert!(token.is_cancelled());
    }

    #[test]
    fn backpressure_does_not_count_toward_limit() {
        let token = CancellationToken::new();
        let collector =
            MetricsCollector::new(Instant::now(), Duration::from_secs(1)).with_limit(1, token.clone());

        collector.record_backpressure(Duration::from_millis(40));
        collector.record_unadmitted(7, Duration::from_millis(10));

        assert!(!token.is_cancelled());
        assert_eq!(collector.recorded(), 0);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.backpressured, 1);
        assert_eq!(snapshot.unadmitted, 7);
        assert_eq!(snapshot.blocked_for, Duration::from_millis(50));
    }

    #[test]
    fn snapshot_is_detached_from_later_records() {
        let collector = MetricsCollector::new(Instant::now(), Duration::from_secs(1));
        let endpoint = Endpoint::get("http://localhost/");

        collector.record(RequestOutcome::success(endpoint.clone(), Instant::now(), Duration::ZERO, Some(200)));
        let before = collector.snapshot();
        collector.record(RequestOutcome::success(endpoint, Instant::now(), Duration::ZERO, Some(200)));

        assert_eq!(before.total, 1);
        assert_eq!(collector.snapshot().total, 2);
    }
}
