use crate::engine::MetricsCollector;
use crate::engine::pool::{Job, WorkerPool};
use crate::engine::snapshot::PoolGauges;
use crate::types::MetricsSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

/// Publishes live snapshots while a run is in progress.
pub struct Aggregator<J: Job> {
    metrics: Arc<MetricsCollector>,
    pool: WorkerPool<J>,
    snapshot_tx: watch::Sender<Option<MetricsSnapshot>>,
    cancel: CancellationToken,
}

impl<J: Job> Aggregator<J> {
    pub fn new(
        metrics: Arc<MetricsCollector>,
        pool: WorkerPool<J>,
        snapshot_tx: watch::Sender<Option<MetricsSnapshot>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            metrics,
            pool,
            snapshot_tx,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut published = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let snapshot = self.metrics.snapshot_with(pool_gauges(&self.pool));
                    published += 1;
                    if published % 10 == 0 {
                        tracing::debug!(
                            "{} requests, {:.1} req/s, {} in flight",
                            snapshot.total,
                            snapshot.requests_per_sec,
                            self.pool.in_flight()
                        );
                    }
                    let _ = self.snapshot_tx.send(Some(snapshot));
                }
            }
        }
    }
}

pub fn pool_gauges<J: Job>(pool: &WorkerPool<J>) -> PoolGauges {
    PoolGauges {
        in_flight_peak: pool.in_flight_peak(),
        abandoned: pool.abandoned(),
    }
}
