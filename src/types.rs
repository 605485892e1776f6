use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Workload
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadMode {
    /// Fixed number of virtual users, each waiting on its own previous request
    #[default]
    #[serde(alias = "closed")]
    ClosedLoop,
    /// Fixed arrival rate, independent of response times
    #[serde(alias = "open")]
    OpenLoop,
}

impl WorkloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadMode::ClosedLoop => "closed_loop",
            WorkloadMode::OpenLoop => "open_loop",
        }
    }
}

impl FromStr for WorkloadMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "closed" | "closed_loop" => Ok(WorkloadMode::ClosedLoop),
            "open" | "open_loop" => Ok(WorkloadMode::OpenLoop),
            other => Err(format!(
                "unknown mode '{}', expected 'closed' or 'open'",
                other
            )),
        }
    }
}

/// What happens to an open-loop emission when every slot is busy and the
/// pending queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Scheduler waits for queue space; the wait shows up as queueing delay
    #[default]
    Block,
    /// Evict the oldest queued emission and record it as a backpressure drop
    DropOldest,
}

impl BackpressurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressurePolicy::Block => "block",
            BackpressurePolicy::DropOldest => "drop_oldest",
        }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop" | "drop_oldest" => Ok(BackpressurePolicy::DropOldest),
            other => Err(format!(
                "unknown backpressure policy '{}', expected 'block' or 'drop-oldest'",
                other
            )),
        }
    }
}

/// Pause between the end of one iteration and the start of the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkTime {
    Fixed(Duration),
    Uniform { min: Duration, max: Duration },
}

impl Default for ThinkTime {
    fn default() -> Self {
        ThinkTime::Fixed(Duration::ZERO)
    }
}

impl ThinkTime {
    pub fn sample(&self) -> Duration {
        match *self {
            ThinkTime::Fixed(d) => d,
            ThinkTime::Uniform { min, max } if min >= max => min,
            ThinkTime::Uniform { min, max } => {
                let micros = rand::rng().random_range(min.as_micros() as u64..=max.as_micros() as u64);
                Duration::from_micros(micros)
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            ThinkTime::Fixed(d) => d.is_zero(),
            ThinkTime::Uniform { max, .. } => max.is_zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Arc<str>,
    pub method: reqwest::Method,
}

impl Endpoint {
    pub fn get(url: impl AsRef<str>) -> Self {
        Self {
            url: Arc::from(url.as_ref()),
            method: reqwest::Method::GET,
        }
    }

    pub fn with_method(mut self, method: reqwest::Method) -> Self {
        self.method = method;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Max simultaneous in-flight requests. `None` derives it from the mode.
    pub capacity: Option<u32>,
    /// Pending open-loop emissions held while every slot is busy
    pub queue_capacity: u32,
    pub backpressure: BackpressurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            queue_capacity: 1_000,
            backpressure: BackpressurePolicy::Block,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub mode: WorkloadMode,
    pub concurrency: u32,
    pub target_rate: f64,
    pub duration: Duration,
    pub think_time: ThinkTime,
    pub target: Endpoint,
    pub pool: PoolConfig,
    pub grace_period: Duration,
    pub request_timeout: Duration,
    /// Stop once this many outcomes were recorded (0 = unlimited)
    pub max_requests: u64,
}

impl WorkloadConfig {
    pub fn closed_loop(url: impl AsRef<str>, concurrency: u32, duration: Duration) -> Self {
        Self {
            mode: WorkloadMode::ClosedLoop,
            concurrency,
            target_rate: 0.0,
            duration,
            think_time: ThinkTime::default(),
            target: Endpoint::get(url),
            pool: PoolConfig::default(),
            grace_period: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_requests: 0,
        }
    }

    pub fn open_loop(url: impl AsRef<str>, target_rate: f64, duration: Duration) -> Self {
        Self {
            mode: WorkloadMode::OpenLoop,
            concurrency: 0,
            target_rate,
            ..Self::closed_loop(url, 0, duration)
        }
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Effective number of execution slots.
    pub fn pool_capacity(&self) -> u32 {
        if let Some(capacity) = self.pool.capacity {
            return capacity;
        }
        match self.mode {
            WorkloadMode::ClosedLoop => self.concurrency,
            WorkloadMode::OpenLoop => (self.target_rate.ceil() as u32).max(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.mode {
            WorkloadMode::ClosedLoop => {
                if self.concurrency == 0 {
                    return Err(Error::config("concurrency must be at least 1 in closed-loop mode"));
                }
            }
            WorkloadMode::OpenLoop => {
                if !self.target_rate.is_finite() || self.target_rate <= 0.0 {
                    return Err(Error::config(format!(
                        "target rate must be a positive number in open-loop mode, got {}",
                        self.target_rate
                    )));
                }
            }
        }

        if self.duration.is_zero() {
            return Err(Error::config("duration must be greater than zero"));
        }
        if self.pool.capacity == Some(0) {
            return Err(Error::config("pool capacity must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::config("request timeout must be greater than zero"));
        }
        if let ThinkTime::Uniform { min, max } = self.think_time
            && min > max
        {
            return Err(Error::config(format!(
                "think time range is inverted: {:?} > {:?}",
                min, max
            )));
        }

        let url = self.target.url.trim();
        if url.is_empty() {
            return Err(Error::config("target URL is required"));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::config(format!(
                "target URL must start with http:// or https://, got '{}'",
                url
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Dns,
    Connect,
    Tls,
    Refused,
    Reset,
    Body,
    Other,
    /// Response arrived with a 4xx/5xx status
    Status,
    /// Never sent: the generator had no capacity left
    BackpressureDrop,
}

impl ErrorKind {
    pub fn from_reqwest_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ErrorKind::Timeout;
        }

        // reqwest wraps the interesting part in the source chain
        let message = error_chain_text(err);

        if err.is_connect() {
            if message.contains("dns") || message.contains("resolve") {
                ErrorKind::Dns
            } else if message.contains("refused") {
                ErrorKind::Refused
            } else if message.contains("reset") {
                ErrorKind::Reset
            } else {
                ErrorKind::Connect
            }
        } else if err.is_body() || err.is_decode() {
            ErrorKind::Body
        } else if message.contains("reset") {
            ErrorKind::Reset
        } else if message.contains("tls") || message.contains("certificate") {
            ErrorKind::Tls
        } else {
            ErrorKind::Other
        }
    }

    /// Failures caused by the target or the network, as opposed to the
    /// generator running out of capacity.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ErrorKind::Status | ErrorKind::BackpressureDrop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dns => "dns",
            ErrorKind::Connect => "connect",
            ErrorKind::Tls => "tls",
            ErrorKind::Refused => "refused",
            ErrorKind::Reset => "reset",
            ErrorKind::Body => "body",
            ErrorKind::Other => "other",
            ErrorKind::Status => "status",
            ErrorKind::BackpressureDrop => "backpressure_drop",
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "try increasing --timeout",
            ErrorKind::Dns => "check the hostname",
            ErrorKind::Connect => "check network and firewall",
            ErrorKind::Tls => "check the server certificate",
            ErrorKind::Refused => "is the server running?",
            ErrorKind::Reset => "server closed the connection",
            ErrorKind::Body => "response body error",
            ErrorKind::Other => "",
            ErrorKind::Status => "server answered with an error status",
            ErrorKind::BackpressureDrop => "generator saturated, raise --capacity or --queue",
        }
    }
}

fn error_chain_text(err: &reqwest::Error) -> String {
    let mut text = err.to_string().to_lowercase();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}

// ============================================================================
// Request Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Error(ErrorKind),
}

/// Result of one request attempt. Built by a requester (or by the scheduler
/// for drops) and handed to the metrics collector by value.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// When the request was actually handed to the transport
    pub start_time: Instant,
    /// Just-before-send to just-after-full-response, excluding queueing
    pub latency: Duration,
    /// Time between the intended start and `start_time`
    pub queue_delay: Duration,
    pub status: OutcomeStatus,
    pub status_code: Option<u16>,
    pub endpoint: Endpoint,
}

impl RequestOutcome {
    pub fn success(endpoint: Endpoint, start_time: Instant, latency: Duration, status_code: Option<u16>) -> Self {
        Self {
            start_time,
            latency,
            queue_delay: Duration::ZERO,
            status: OutcomeStatus::Success,
            status_code,
            endpoint,
        }
    }

    pub fn failure(endpoint: Endpoint, start_time: Instant, latency: Duration, kind: ErrorKind) -> Self {
        Self {
            start_time,
            latency,
            queue_delay: Duration::ZERO,
            status: OutcomeStatus::Error(kind),
            status_code: None,
            endpoint,
        }
    }

    /// An emission the generator could not admit. Nothing was sent.
    pub fn dropped(endpoint: Endpoint, scheduled_at: Instant, dropped_at: Instant) -> Self {
        Self {
            start_time: dropped_at,
            latency: Duration::ZERO,
            queue_delay: dropped_at.saturating_duration_since(scheduled_at),
            status: OutcomeStatus::Error(ErrorKind::BackpressureDrop),
            status_code: None,
            endpoint,
        }
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Attach the generator-induced delay between scheduling and sending.
    pub fn with_queue_delay(mut self, scheduled_at: Instant) -> Self {
        self.queue_delay = self.start_time.saturating_duration_since(scheduled_at);
        self
    }

    pub fn total_latency(&self) -> Duration {
        self.queue_delay + self.latency
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            OutcomeStatus::Success => None,
            OutcomeStatus::Error(kind) => Some(kind),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.error_kind() == Some(ErrorKind::BackpressureDrop)
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub stddev_us: f64,
    pub p50_us: u64,
    pub p75_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub elapsed_secs: u32,
    pub requests: u64,
    pub errors: u64,
}

/// Point-in-time view of a run's metrics. Never altered after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub total: u64,
    pub successful: u64,
    /// Transport and status failures (drops excluded)
    pub failed: u64,
    pub dropped: u64,
    /// Emissions admitted only after waiting for pool room (block policy)
    pub backpressured: u64,
    /// Total time the scheduler spent waiting for pool room
    #[serde(with = "humantime_serde")]
    pub blocked_for: Duration,
    /// Emissions that came due but never entered the pool because the
    /// scheduler was still blocked when the run ended
    pub unadmitted: u64,
    pub error_rate: f64,
    /// Completed requests per second over the load window; drain time is
    /// not part of the window
    pub requests_per_sec: f64,

    pub status_codes: HashMap<u16, u64>,
    pub errors: HashMap<ErrorKind, u64>,

    /// Requester-measured latency
    pub service: LatencySummary,
    /// Generator-induced delay before sending
    pub queue: LatencySummary,
    pub total_latency: LatencySummary,

    pub timeline: Vec<TimelineBucket>,

    pub in_flight_peak: u32,
    /// Queued emissions discarded at shutdown without ever starting
    pub abandoned: u64,
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Runner lifecycle. Declaration order is the only allowed direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RunPhase {
    #[default]
    NotStarted,
    Running,
    Draining,
    Stopped,
}

impl RunPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, RunPhase::Running | RunPhase::Draining)
    }

    pub fn is_terminal(&self) -> bool {
        *self == RunPhase::Stopped
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::NotStarted => "not_started",
            RunPhase::Running => "running",
            RunPhase::Draining => "draining",
            RunPhase::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_loop_requires_concurrency() {
        let config = WorkloadConfig::closed_loop("http://localhost/predict", 0, Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn open_loop_rejects_bad_rates() {
        for rate in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            let config = WorkloadConfig::open_loop("http://localhost/predict", rate, Duration::from_secs(1));
            assert!(config.validate().is_err(), "rate {} accepted", rate);
        }
    }

    #[test]
    fn open_loop_ignores_concurrency() {
        let config = WorkloadConfig::open_loop("http://localhost/predict", 2.5, Duration::from_secs(1));
        assert_eq!(config.concurrency, 0);
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_capacity(), 3);
    }

    #[test]
    fn rejects_zero_duration_and_capacity() {
        let config = WorkloadConfig::closed_loop("http://localhost/", 2, Duration::ZERO);
        assert!(config.validate().is_err());

        let config = WorkloadConfig::closed_loop("http://localhost/", 2, Duration::from_secs(1)).with_pool(PoolConfig {
            capacity: Some(0),
            ..PoolConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_http_target() {
        let config = WorkloadConfig::closed_loop("ftp://localhost/", 2, Duration::from_secs(1));
        assert!(config.validate().is_err());
        let config = WorkloadConfig::closed_loop("  ", 2, Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_think_range() {
        let config = WorkloadConfig::closed_loop("http://localhost/", 1, Duration::from_secs(1)).with_think_time(
            ThinkTime::Uniform {
                min: Duration::from_millis(100),
                max: Duration::from_millis(10),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn uniform_think_time_stays_in_range() {
        let think = ThinkTime::Uniform {
            min: Duration::from_millis(10),
            max: Duration::from_millis(100),
        };
        for _ in 0..1_000 {
            let d = think.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(100));
        }
        assert!(!think.is_zero());
        assert!(ThinkTime::default().is_zero());
    }

    #[test]
    fn pool_capacity_defaults_follow_mode() {
        let closed = WorkloadConfig::closed_loop("http://localhost/", 7, Duration::from_secs(1));
        assert_eq!(closed.pool_capacity(), 7);

        let explicit = closed.with_pool(PoolConfig {
            capacity: Some(3),
            ..PoolConfig::default()
        });
        assert_eq!(explicit.pool_capacity(), 3);
    }

    #[test]
    fn mode_and_policy_parse() {
        assert_eq!("open".parse::<WorkloadMode>().unwrap(), WorkloadMode::OpenLoop);
        assert_eq!("closed-loop".parse::<WorkloadMode>().unwrap(), WorkloadMode::ClosedLoop);
        assert!("sideways".parse::<WorkloadMode>().is_err());
        assert_eq!(
            "drop-oldest".parse::<BackpressurePolicy>().unwrap(),
            BackpressurePolicy::DropOldest
        );
        assert!("maybe".parse::<BackpressurePolicy>().is_err());
    }

    #[test]
    fn drops_are_not_transport_errors() {
        assert!(!ErrorKind::BackpressureDrop.is_transport());
        assert!(!ErrorKind::Status.is_transport());
        assert!(ErrorKind::Refused.is_transport());
        assert!(ErrorKind::Timeout.is_transport());
    }

    #[test]
    fn queue_delay_is_separate_from_latency() {
        let scheduled = Instant::now();
        let started = scheduled + Duration::from_millis(40);
        let outcome = RequestOutcome::success(
            Endpoint::get("http://localhost/"),
            started,
            Duration::from_millis(10),
            Some(200),
        )
        .with_queue_delay(scheduled);

        assert_eq!(outcome.latency, Duration::from_millis(10));
        assert_eq!(outcome.queue_delay, Duration::from_millis(40));
        assert_eq!(outcome.total_latency(), Duration::from_millis(50));
    }

    #[test]
    fn phases_are_ordered() {
        assert!(RunPhase::NotStarted < RunPhase::Running);
        assert!(RunPhase::Running < RunPhase::Draining);
        assert!(RunPhase::Draining < RunPhase::Stopped);
        assert!(RunPhase::Stopped.is_terminal());
        assert!(RunPhase::Draining.is_active());
    }
}
