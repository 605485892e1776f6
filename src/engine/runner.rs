use crate::engine::aggregator::{Aggregator, pool_gauges};
use crate::engine::arrival_rate::{Arrival, RateScheduler, SchedulerReport};
use crate::engine::clock::{self, Wake};
use crate::engine::pool::WorkerPool;
use crate::engine::user::VirtualUser;
use crate::engine::MetricsCollector;
use crate::error::{Error, Result};
use crate::requester::Requester;
use crate::types::{MetricsSnapshot, RunPhase, WorkloadConfig, WorkloadMode};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

/// Lifecycle state owned by the runner.
#[derive(Debug)]
pub struct RunState {
    pub phase: RunPhase,
    pub started_at: Option<Instant>,
    pub cancel: CancellationToken,
}

/// Orchestrates one load test: validates the workload, starts the
/// generators, enforces the duration, then drains and finalizes metrics.
///
/// A runner performs a single run. `start`/`stop` may be called from any
/// task; completion is observed through [`TestRunner::phase_rx`] or
/// [`TestRunner::wait`].
#[derive(Clone)]
pub struct TestRunner {
    shared: Arc<Shared>,
}

/// Handles a run in progress needs to serve snapshots.
struct LiveRun {
    metrics: Arc<MetricsCollector>,
    pool: WorkerPool<Arrival>,
}

struct Shared {
    requester: Arc<dyn Requester>,
    state: Mutex<RunState>,
    live: Mutex<Option<LiveRun>>,
    report: Mutex<Option<MetricsSnapshot>>,
    phase_tx: watch::Sender<RunPhase>,
    snapshot_tx: watch::Sender<Option<MetricsSnapshot>>,
}

impl Shared {
    /// Move forward to `next`; phases are never revisited.
    fn advance(&self, state: &mut RunState, next: RunPhase) {
        if next <= state.phase {
            return;
        }
        tracing::info!("Run phase {} -> {}", state.phase.as_str(), next.as_str());
        state.phase = next;
        self.phase_tx.send_replace(next);
    }

    fn advance_to(&self, next: RunPhase) {
        let mut state = self.state.lock();
        self.advance(&mut state, next);
    }
}

impl TestRunner {
    pub fn new(requester: Arc<dyn Requester>) -> Self {
        let (phase_tx, _) = watch::channel(RunPhase::NotStarted);
        let (snapshot_tx, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                requester,
                state: Mutex::new(RunState {
                    phase: RunPhase::NotStarted,
                    started_at: None,
                    cancel: CancellationToken::new(),
                }),
                live: Mutex::new(None),
                report: Mutex::new(None),
                phase_tx,
                snapshot_tx,
            }),
        }
    }

    /// Validate `config` and begin the run in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, config: WorkloadConfig) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut state = self.shared.state.lock();
        match state.phase {
            RunPhase::NotStarted => {}
            RunPhase::Running | RunPhase::Draining => return Err(Error::AlreadyRunning),
            RunPhase::Stopped => return Err(Error::Finished),
        }
        config.validate()?;

        let started_at = clock::now();
        let cancel = state.cancel.clone();
        let metrics = Arc::new(
            MetricsCollector::new(started_at, config.duration).with_limit(config.max_requests, cancel.clone()),
        );
        let pool: WorkerPool<Arrival> = WorkerPool::new(
            config.pool_capacity(),
            config.pool.queue_capacity,
            config.pool.backpressure,
        );
        *self.shared.live.lock() = Some(LiveRun {
            metrics: metrics.clone(),
            pool: pool.clone(),
        });
        state.started_at = Some(started_at);
        self.shared.advance(&mut state, RunPhase::Running);
        drop(state);

        runtime.spawn(orchestrate(self.shared.clone(), config, metrics, pool, cancel, started_at));
        Ok(())
    }

    /// Request a graceful stop. Generators stop starting new work and
    /// in-flight requests get the grace period to finish.
    pub fn stop(&self) -> Result<()> {
        let state = self.shared.state.lock();
        match state.phase {
            RunPhase::NotStarted | RunPhase::Stopped => Err(Error::NotRunning),
            RunPhase::Running | RunPhase::Draining => {
                state.cancel.cancel();
                Ok(())
            }
        }
    }

    /// True from `start` until the run reaches `Stopped`.
    pub fn is_running(&self) -> bool {
        self.phase().is_active()
    }

    pub fn phase(&self) -> RunPhase {
        self.shared.state.lock().phase
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.shared.state.lock().started_at
    }

    pub fn phase_rx(&self) -> watch::Receiver<RunPhase> {
        self.shared.phase_tx.subscribe()
    }

    /// Live snapshots, refreshed while the run is in progress. The last
    /// value published is the final snapshot.
    pub fn snapshot_rx(&self) -> watch::Receiver<Option<MetricsSnapshot>> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Current metrics, or `None` if the run has not started.
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        if let Some(report) = self.shared.report.lock().clone() {
            return Some(report);
        }
        self.shared
            .live
            .lock()
            .as_ref()
            .map(|live| live.metrics.snapshot_with(pool_gauges(&live.pool)))
    }

    /// Wait for the run to reach `Stopped` and return the final snapshot.
    pub async fn wait(&self) -> Result<MetricsSnapshot> {
        if self.phase() == RunPhase::NotStarted {
            return Err(Error::NotRunning);
        }

        let mut phase_rx = self.phase_rx();
        phase_rx
            .wait_for(|phase| phase.is_terminal())
            .await
            .map_err(|_| Error::NotRunning)?;

        self.shared.report.lock().clone().ok_or(Error::NotRunning)
    }
}

async fn orchestrate(
    shared: Arc<Shared>,
    config: WorkloadConfig,
    metrics: Arc<MetricsCollector>,
    pool: WorkerPool<Arrival>,
    cancel: CancellationToken,
    started_at: Instant,
) {
    let deadline = started_at + config.duration;

    let aggregator_cancel = CancellationToken::new();
    let aggregator = tokio::spawn(
        Aggregator::new(
            metrics.clone(),
            pool.clone(),
            shared.snapshot_tx.clone(),
            aggregator_cancel.clone(),
        )
        .run(),
    );

    let mut generators: JoinSet<Option<SchedulerReport>> = JoinSet::new();
    match config.mode {
        WorkloadMode::ClosedLoop => {
            tracing::info!(
                "Starting {} virtual users against {} for {:?}",
                config.concurrency,
                config.target,
                config.duration
            );
            for id in 0..config.concurrency {
                let user = VirtualUser::new(
                    id,
                    shared.requester.clone(),
                    config.target.clone(),
                    config.think_time,
                    pool.clone(),
                    metrics.clone(),
                    cancel.clone(),
                    deadline,
                );
                generators.spawn(async move {
                    user.run().await;
                    None
                });
            }
        }
        WorkloadMode::OpenLoop => {
            tracing::info!(
                "Emitting {} req/s against {} for {:?}",
                config.target_rate,
                config.target,
                config.duration
            );
            let scheduler = RateScheduler::new(
                config.target_rate,
                shared.requester.clone(),
                config.target.clone(),
                pool.clone(),
                metrics.clone(),
                cancel.clone(),
                started_at,
                deadline,
            );
            generators.spawn(async move { Some(scheduler.run().await) });
        }
    }

    match clock::until(deadline, &cancel).await {
        Wake::Elapsed => tracing::info!("Duration elapsed, draining"),
        Wake::Cancelled => tracing::info!("Stop requested, draining"),
    }

    metrics.close_window(clock::now().min(deadline));
    shared.advance_to(RunPhase::Draining);
    cancel.cancel();
    pool.close();

    let mut schedule = None;
    let drained = timeout(config.grace_period, async {
        join_generators(&mut generators, &mut schedule).await;
        pool.wait().await;
    })
    .await
    .is_ok();

    if !drained {
        tracing::warn!(
            "Grace period of {:?} expired with {} requests in flight, forcing shutdown",
            config.grace_period,
            pool.in_flight()
        );
        pool.abort();
        join_generators(&mut generators, &mut schedule).await;
        pool.wait().await;
    }

    if let Some(schedule) = schedule {
        tracing::info!(
            "Schedule: {} emitted, {} dropped, {} backpressured ({:?} blocked), {} never admitted",
            schedule.emitted,
            schedule.dropped,
            schedule.backpressured,
            schedule.blocked_for,
            schedule.unadmitted
        );
    }

    aggregator_cancel.cancel();
    let _ = aggregator.await;

    let report = metrics.snapshot_with(pool_gauges(&pool));
    tracing::info!(
        "Run finished: {} requests, {} failed, {} dropped",
        report.total,
        report.failed,
        report.dropped
    );
    *shared.report.lock() = Some(report.clone());
    shared.snapshot_tx.send_replace(Some(report));
    shared.advance_to(RunPhase::Stopped);
}

async fn join_generators(generators: &mut JoinSet<Option<SchedulerReport>>, schedule: &mut Option<SchedulerReport>) {
    while let Some(joined) = generators.join_next().await {
        match joined {
            Ok(Some(report)) => *schedule = Some(report),
            Ok(None) => {}
            Err(e) => tracing::error!("Generator task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, RequestOutcome};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Instant200;

    #[async_trait]
    impl Requester for Instant200 {
        async fn send(&self, endpoint: &Endpoint) -> RequestOutcome {
            tokio::time::sleep(Duration::from_millis(5)).await;
            RequestOutcome::success(endpoint.clone(), Instant::now(), Duration::from_millis(5), Some(200))
        }
    }

    fn runner() -> TestRunner {
        TestRunner::new(Arc::new(Instant200))
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let runner = runner();
        assert!(matches!(runner.stop(), Err(Error::NotRunning)));
        assert_eq!(runner.phase(), RunPhase::NotStarted);
        assert!(runner.started_at().is_none());
        assert!(runner.snapshot().is_none());
        assert!(matches!(runner.wait().await, Err(Error::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let runner = runner();
        let config = WorkloadConfig::closed_loop("http://localhost/", 2, Duration::from_secs(1));
        runner.start(config.clone()).unwrap();
        assert!(runner.is_running());
        assert!(matches!(runner.start(config.clone()), Err(Error::AlreadyRunning)));

        runner.wait().await.unwrap();
        assert!(!runner.is_running());
        assert!(matches!(runner.start(config), Err(Error::Finished)));
        assert!(matches!(runner.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn start_outside_runtime_is_rejected() {
        let runner = runner();
        let config = WorkloadConfig::closed_loop("http://localhost/", 1, Duration::from_secs(1));

        assert!(matches!(runner.start(config), Err(Error::NoRuntime)));
        assert_eq!(runner.phase(), RunPhase::NotStarted);
        assert!(runner.started_at().is_none());
        assert!(runner.snapshot().is_none());
    }

    #[tokio::test]
    async fn invalid_config_leaves_runner_untouched() {
        let runner = runner();
        let config = WorkloadConfig::open_loop("http://localhost/", 0.0, Duration::from_secs(1));
        assert!(matches!(runner.start(config), Err(Error::Config(_))));
        assert_eq!(runner.phase(), RunPhase::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn phases_advance_in_order() {
        let runner = runner();
        let mut phase_rx = runner.phase_rx();
        let config = WorkloadConfig::closed_loop("http://localhost/", 1, Duration::from_millis(200));
        runner.start(config).unwrap();

        let mut seen = vec![*phase_rx.borrow_and_update()];
        while phase_rx.changed().await.is_ok() {
            let phase = *phase_rx.borrow_and_update();
            seen.push(phase);
            if phase.is_terminal() {
                break;
            }
        }

        assert_eq!(seen.first(), Some(&RunPhase::Running));
        assert_eq!(seen.last(), Some(&RunPhase::Stopped));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
