use crate::types::{ErrorKind, LatencySummary, RequestOutcome, TimelineBucket};
use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const MAX_TRACKABLE_US: u64 = 60_000_000;

/// Running aggregate of recorded outcomes. Not synchronized; the
/// [`MetricsCollector`](super::MetricsCollector) owns it behind a lock.
pub struct Stats {
    service: Histogram<u64>,
    queue: Histogram<u64>,
    total_latency: Histogram<u64>,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub dropped: u64,
    pub status_codes: HashMap<u16, u64>,
    pub errors: HashMap<ErrorKind, u64>,
    pub timeline: Vec<TimelineBucket>,
    /// Emissions admitted only after waiting for pool room
    pub backpressured: u64,
    pub blocked_for: Duration,
    /// Emissions that came due but never entered the pool
    pub unadmitted: u64,
    timeline_limit: usize,
    start_time: Instant,
    window_end: Option<Instant>,
}

fn histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_US, 3).expect("Failed to create histogram")
}

fn micros(d: Duration) -> u64 {
    (d.as_micros() as u64).clamp(1, MAX_TRACKABLE_US)
}

impl Stats {
    pub fn new(start_time: Instant, duration: Duration) -> Self {
        let timeline_limit = duration.as_secs() as usize + 60;

        Self {
            service: histogram(),
            queue: histogram(),
            total_latency: histogram(),
            total: 0,
            successful: 0,
            failed: 0,
            dropped: 0,
            status_codes: HashMap::new(),
            errors: HashMap::new(),
            timeline: Vec::with_capacity(timeline_limit.min(3_660)),
            backpressured: 0,
            blocked_for: Duration::ZERO,
            unadmitted: 0,
            timeline_limit,
            start_time,
            window_end: None,
        }
    }

    pub fn record_backpressure(&mut self, waited: Duration) {
        self.backpressured += 1;
        self.blocked_for += waited;
    }

    pub fn record_unadmitted(&mut self, count: u64, waited: Duration) {
        self.unadmitted += count;
        self.blocked_for += waited;
    }

    /// Stop the run clock at `at`. Later completions still count, but
    /// throughput is measured over the load window only.
    pub fn close_window(&mut self, at: Instant) {
        if self.window_end.is_none() {
            self.window_end = Some(at.max(self.start_time));
        }
    }

    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.total += 1;

        if let Some(code) = outcome.status_code {
            *self.status_codes.entry(code).or_insert(0) += 1;
        }

        match outcome.error_kind() {
            None => self.successful += 1,
            Some(kind) => {
                *self.errors.entry(kind).or_insert(0) += 1;
                if kind == ErrorKind::BackpressureDrop {
                    self.dropped += 1;
                } else {
                    self.failed += 1;
                }
            }
        }

        // A drop never reached the target, so it has no service latency
        if !outcome.is_dropped() {
            let _ = self.service.record(micros(outcome.latency));
            let _ = self.total_latency.record(micros(outcome.total_latency()));
        }
        let _ = self.queue.record(micros(outcome.queue_delay));

        self.update_timeline(outcome);
    }

    // Bucketed by start second; outcomes arrive in completion order
    fn update_timeline(&mut self, outcome: &RequestOutcome) {
        let second = outcome.start_time.saturating_duration_since(self.start_time).as_secs() as usize;
        if second >= self.timeline_limit {
            return;
        }

        while self.timeline.len() <= second {
            let elapsed_secs = self.timeline.len() as u32;
            self.timeline.push(TimelineBucket {
                elapsed_secs,
                requests: 0,
                errors: 0,
            });
        }

        let bucket = &mut self.timeline[second];
        bucket.requests += 1;
        if !outcome.is_success() {
            bucket.errors += 1;
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        match self.window_end {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Completed requests per second; drops are not throughput.
    pub fn requests_per_sec(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.successful + self.failed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        let attempted = self.successful + self.failed;
        if attempted > 0 {
            self.failed as f64 / attempted as f64
        } else {
            0.0
        }
    }

    pub fn service_latency(&self) -> LatencySummary {
        summarize(&self.service)
    }

    pub fn queue_delay(&self) -> LatencySummary {
        summarize(&self.queue)
    }

    pub fn total_latency(&self) -> LatencySummary {
        summarize(&self.total_latency)
    }
}

fn summarize(histogram: &Histogram<u64>) -> LatencySummary {
    if histogram.is_empty() {
        return LatencySummary::default();
    }

    LatencySummary {
        min_us: histogram.min(),
        max_us: histogram.max(),
        mean_us: histogram.mean(),
        stddev_us: histogram.stdev(),
        p50_us: histogram.value_at_percentile(50.0),
        p75_us: histogram.value_at_percentile(75.0),
        p90_us: histogram.value_at_percentile(90.0),
        p95_us: histogram.value_at_percentile(95.0),
        p99_us: histogram.value_at_percentile(99.0),
        p999_us: histogram.value_at_percentile(99.9),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;

    fn endpoint() -> Endpoint {
        Endpoint::get("http://localhost/predict")
    }

    #[test]
    fn counts_by_outcome_kind() {
        let start = Instant::now();
        let mut stats = Stats::new(start, Duration::from_secs(10));

        stats.record(&RequestOutcome::success(endpoint(), start, Duration::from_millis(5), Some(200)));
        stats.record(
            &RequestOutcome::failure(endpoint(), start, Duration::from_millis(7), ErrorKind::Status)
                .with_status_code(503),
        );
        stats.record(&RequestOutcome::failure(endpoint(), start, Duration::from_millis(2), ErrorKind::Refused));
        stats.record(&RequestOutcome::dropped(endpoint(), start, start));

        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.status_codes.get(&200), Some(&1));
        assert_eq!(stats.status_codes.get(&503), Some(&1));
        assert_eq!(stats.errors.get(&ErrorKind::BackpressureDrop), Some(&1));
        assert_eq!(stats.errors.get(&ErrorKind::Refused), Some(&1));
        assert!((stats.error_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn drops_do_not_pollute_service_latency() {
        let start = Instant::now();
        let mut stats = Stats::new(start, Duration::from_secs(10));

        stats.record(&RequestOutcome::success(endpoint(), start, Duration::from_millis(20), Some(200)));
        stats.record(&RequestOutcome::dropped(endpoint(), start, start + Duration::from_secs(2)));

        let service = stats.service_latency();
        assert!(service.max_us >= 19_900 && service.max_us <= 20_100);
        assert!(stats.queue_delay().max_us >= 1_990_000);
    }

    #[test]
    fn latency_percentiles() {
        let start = Instant::now();
        let mut stats = Stats::new(start, Duration::from_secs(10));
        for ms in 1..=100u64 {
            stats.record(&RequestOutcome::success(endpoint(), start, Duration::from_millis(ms), Some(200)));
        }

        let service = stats.service_latency();
        assert!((49_500..=50_500).contains(&service.p50_us));
        assert!((98_500..=99_500).contains(&service.p99_us));
        assert!(service.min_us <= 1_001);
    }

    #[test]
    fn timeline_buckets_by_start_second() {
        let start = Instant::now();
        let mut stats = Stats::new(start, Duration::from_secs(10));

        // Completion order differs from start order
        stats.record(&RequestOutcome::success(endpoint(), start + Duration::from_millis(2_100), Duration::ZERO, None));
        stats.record(&RequestOutcome::failure(endpoint(), start + Duration::from_millis(100), Duration::ZERO, ErrorKind::Timeout));
        stats.record(&RequestOutcome::success(endpoint(), start + Duration::from_millis(200), Duration::ZERO, None));

        assert_eq!(stats.timeline.len(), 3);
        assert_eq!(stats.timeline[0].requests, 2);
        assert_eq!(stats.timeline[0].errors, 1);
        assert_eq!(stats.timeline[1].requests, 0);
        assert_eq!(stats.timeline[2].requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_window_stops_the_clock() {
        let start = Instant::now();
        let mut stats = Stats::new(start, Duration::from_secs(10));
        for _ in 0..20 {
            stats.record(&RequestOutcome::success(endpoint(), start, Duration::from_millis(900), Some(200)));
        }

        stats.close_window(start + Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(3)).await;
        stats.close_window(Instant::now());

        assert_eq!(stats.elapsed(), Duration::from_secs(2));
        assert!((stats.requests_per_sec() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn backpressure_is_tallied_apart_from_outcomes() {
        let mut stats = Stats::new(Instant::now(), Duration::from_secs(1));
        stats.record_backpressure(Duration::from_millis(30));
        stats.record_backpressure(Duration::from_millis(20));
        stats.record_unadmitted(3, Duration::from_millis(50));

        assert_eq!(stats.backpressured, 2);
        assert_eq!(stats.unadmitted, 3);
        assert_eq!(stats.blocked_for, Duration::from_millis(100));
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn empty_stats_summarize_to_zero() {
        let stats = Stats::new(Instant::now(), Duration::from_secs(1));
        assert_eq!(stats.service_latency(), LatencySummary::default());
        assert_eq!(stats.error_rate(), 0.0);
    }
}
