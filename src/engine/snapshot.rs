use crate::engine::Stats;
use crate::types::MetricsSnapshot;

/// Pool figures that live outside the collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolGauges {
    pub in_flight_peak: u32,
    pub abandoned: u64,
}

pub fn create_snapshot(stats: &Stats, gauges: PoolGauges) -> MetricsSnapshot {
    MetricsSnapshot {
        elapsed: stats.elapsed(),
        total: stats.total,
        successful: stats.successful,
        failed: stats.failed,
        dropped: stats.dropped,
        backpressured: stats.backpressured,
        blocked_for: stats.blocked_for,
        unadmitted: stats.unadmitted,
        error_rate: stats.error_rate(),
        requests_per_sec: stats.requests_per_sec(),

        status_codes: stats.status_codes.clone(),
        errors: stats.errors.clone(),

        service: stats.service_latency(),
        queue: stats.queue_delay(),
        total_latency: stats.total_latency(),

        timeline: stats.timeline.clone(),

        in_flight_peak: gauges.in_flight_peak,
        abandoned: gauges.abandoned,
    }
}
