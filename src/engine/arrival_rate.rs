use crate::engine::MetricsCollector;
use crate::engine::clock::{self, Ticker};
use crate::engine::pool::{Admission, Job, WorkerPool};
use crate::requester::Requester;
use crate::types::{Endpoint, RequestOutcome};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One open-loop emission: a request scheduled for `scheduled_at`.
pub struct Arrival {
    seq: u64,
    scheduled_at: Instant,
    endpoint: Endpoint,
    requester: Arc<dyn Requester>,
    metrics: Arc<MetricsCollector>,
}

impl Arrival {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Record this emission as dropped. It was never sent.
    fn record_drop(self) {
        let outcome = RequestOutcome::dropped(self.endpoint, self.scheduled_at, clock::now());
        self.metrics.record(outcome);
    }
}

impl Job for Arrival {
    fn run(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let outcome = self.requester.send(&self.endpoint).await;
            self.metrics.record(outcome.with_queue_delay(self.scheduled_at));
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerReport {
    /// Emissions the pool accepted, including ones later evicted
    pub emitted: u64,
    pub dropped: u64,
    /// Emissions that had to wait for pool room under the block policy
    pub backpressured: u64,
    pub blocked_for: Duration,
    /// Emissions that came due but never entered the pool
    pub unadmitted: u64,
}

/// Open-loop generator: emits requests at a fixed rate whether or not
/// earlier ones have finished.
pub struct RateScheduler {
    rate: f64,
    requester: Arc<dyn Requester>,
    endpoint: Endpoint,
    pool: WorkerPool<Arrival>,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
    origin: Instant,
    deadline: Instant,
}

impl RateScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate: f64,
        requester: Arc<dyn Requester>,
        endpoint: Endpoint,
        pool: WorkerPool<Arrival>,
        metrics: Arc<MetricsCollector>,
        cancel: CancellationToken,
        origin: Instant,
        deadline: Instant,
    ) -> Self {
        Self {
            rate,
            requester,
            endpoint,
            pool,
            metrics,
            cancel,
            origin,
            deadline,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos((1e9 / self.rate).round().max(1.0) as u64)
    }

    pub async fn run(self) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        if !self.rate.is_finite() || self.rate <= 0.0 {
            tracing::warn!("Arrival rate is {}, no requests will be emitted", self.rate);
            return report;
        }

        let mut ticker = Ticker::starting_at(self.origin, self.interval());

        tracing::info!(
            "Starting rate scheduler: {} req/s (every {:?}), {} slots",
            self.rate,
            ticker.interval(),
            self.pool.capacity()
        );

        let mut warned = false;
        loop {
            // Duration expiry is a hard cutoff for starting new work
            if ticker.next_due() >= self.deadline {
                break;
            }
            let Some(scheduled_at) = ticker.tick(&self.cancel).await else {
                break;
            };

            let arrival = Arrival {
                seq: report.emitted,
                scheduled_at,
                endpoint: self.endpoint.clone(),
                requester: self.requester.clone(),
                metrics: self.metrics.clone(),
            };

            let submitted_at = clock::now();
            let admission = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                admission = self.pool.submit(arrival) => admission.ok(),
            };
            let Some(admission) = admission else {
                // Stopped or closed while waiting for room
                let waited = submitted_at.elapsed();
                report.unadmitted += 1;
                report.blocked_for += waited;
                self.metrics.record_unadmitted(1, waited);
                break;
            };
            report.emitted += 1;

            match admission {
                Admission::Started | Admission::Queued => {}
                Admission::Evicted(evicted) => {
                    if !warned {
                        tracing::warn!("Worker pool saturated, dropping oldest pending requests");
                        warned = true;
                    }
                    tracing::debug!("Dropped emission #{}", evicted.seq());
                    report.dropped += 1;
                    evicted.record_drop();
                }
                Admission::Backpressured { waited } => {
                    if !warned {
                        tracing::warn!("Worker pool saturated, emissions are blocking");
                        warned = true;
                    }
                    report.backpressured += 1;
                    report.blocked_for += waited;
                    self.metrics.record_backpressure(waited);
                }
            }
        }

        // Ticks that fell due while the scheduler sat blocked
        let end = clock::now().min(self.deadline);
        let missed = ticker.due_before(end).saturating_sub(ticker.fired());
        if missed > 0 {
            tracing::warn!("{} emissions were never admitted while the pool was full", missed);
            report.unadmitted += missed;
            self.metrics.record_unadmitted(missed, Duration::ZERO);
        }

        tracing::info!(
            "Rate scheduler finished: {} emitted, {} dropped, {} blocked, {} unadmitted",
            report.emitted,
            report.dropped,
            report.backpressured,
            report.unadmitted
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackpressurePolicy;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recording {
        latency: Duration,
        starts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Requester for Recording {
        async fn send(&self, endpoint: &Endpoint) -> RequestOutcome {
            let start = Instant::now();
            self.starts.lock().push(start);
            tokio::time::sleep(self.latency).await;
            RequestOutcome::success(endpoint.clone(), start, start.elapsed(), Some(200))
        }
    }

    fn recording(latency_ms: u64) -> Arc<Recording> {
        Arc::new(Recording {
            latency: Duration::from_millis(latency_ms),
            starts: Mutex::new(Vec::new()),
        })
    }

    fn scheduler(
        rate: f64,
        requester: Arc<Recording>,
        pool: WorkerPool<Arrival>,
        metrics: Arc<MetricsCollector>,
        cancel: CancellationToken,
        duration: Duration,
    ) -> RateScheduler {
        let origin = Instant::now();
        RateScheduler::new(
            rate,
            requester,
            Endpoint::get("http://localhost/"),
            pool,
            metrics,
            cancel,
            origin,
            origin + duration,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn emits_at_target_rate_regardless_of_latency() {
        let requester = recording(2_000);
        let pool = WorkerPool::new(1_000, 1_000, BackpressurePolicy::Block);
        let metrics = Arc::new(MetricsCollector::new(Instant::now(), Duration::from_secs(2)));

        let report = scheduler(10.0, requester.clone(), pool.clone(), metrics.clone(), CancellationToken::new(), Duration::from_secs(2))
            .run()
            .await;
        assert_eq!(report.emitted, 20);
        assert_eq!(report.dropped, 0);

        let starts = requester.starts.lock().clone();
        assert_eq!(starts.len(), 20);
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
        }

        pool.close();
        pool.wait().await;
        assert_eq!(metrics.snapshot().total, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_drops_oldest() {
        let requester = recording(1_000);
        let pool = WorkerPool::new(5, 10, BackpressurePolicy::DropOldest);
        let metrics = Arc::new(MetricsCollector::new(Instant::now(), Duration::from_secs(1)));

        // 100 emissions inside 100ms against 1s requests
        let report = scheduler(1_000.0, requester, pool.clone(), metrics.clone(), CancellationToken::new(), Duration::from_millis(100))
            .run()
            .await;
        assert_eq!(report.emitted, 100);
        assert_eq!(report.dropped, 85);
        assert_eq!(pool.in_flight(), 5);

        pool.close();
        pool.wait().await;
        let snapshot = metrics.snapshot_with(Default::default());
        assert_eq!(snapshot.dropped, 85);
        assert_eq!(snapshot.successful, 5);
        assert_eq!(pool.abandoned(), 10);
        assert_eq!(pool.in_flight_peak(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_emissions_are_accounted_at_stop() {
        let requester = recording(1_000);
        let pool = WorkerPool::new(5, 0, BackpressurePolicy::Block);
        let metrics = Arc::new(MetricsCollector::new(Instant::now(), Duration::from_millis(100)));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            scheduler(1_000.0, requester, pool.clone(), metrics.clone(), cancel.clone(), Duration::from_millis(100))
                .run(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        pool.close();

        let report = handle.await.unwrap();
        // 100 ticks came due: 5 started, the 6th waited until stop, 94 never fired
        assert_eq!(report.emitted, 5);
        assert_eq!(report.unadmitted, 95);
        assert_eq!(report.emitted + report.unadmitted, 100);
        assert_eq!(report.backpressured, 0);
        assert_eq!(report.blocked_for, Duration::from_millis(95));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.unadmitted, 95);
        assert_eq!(snapshot.blocked_for, Duration::from_millis(95));
    }

    #[tokio::test(start_paused = true)]
    async fn block_policy_waits_for_room() {
        let requester = recording(70);
        let pool = WorkerPool::new(1, 0, BackpressurePolicy::Block);
        let metrics = Arc::new(MetricsCollector::new(Instant::now(), Duration::from_millis(200)));

        // One slot, 70ms requests every 50ms: emissions 1..3 wait 20, 40, 60ms
        let report = scheduler(20.0, requester, pool.clone(), metrics.clone(), CancellationToken::new(), Duration::from_millis(200))
            .run()
            .await;
        assert_eq!(report.emitted, 4);
        assert_eq!(report.backpressured, 3);
        assert_eq!(report.blocked_for, Duration::from_millis(120));
        assert_eq!(report.unadmitted, 0);

        pool.close();
        pool.wait().await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.successful, 4);
        assert_eq!(snapshot.backpressured, 3);
        assert_eq!(snapshot.blocked_for, Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_emission_immediately() {
        let requester = recording(10);
        let pool = WorkerPool::new(10, 10, BackpressurePolicy::Block);
        let metrics = Arc::new(MetricsCollector::new(Instant::now(), Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            scheduler(10.0, requester, pool, metrics, cancel.clone(), Duration::from_secs(60)).run(),
        );
        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.emitted, 5);
    }
}
