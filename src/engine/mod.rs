mod aggregator;
mod arrival_rate;
pub mod clock;
mod metrics;
pub mod pool;
mod runner;
mod snapshot;
mod stats;
mod user;

pub use arrival_rate::{Arrival, RateScheduler, SchedulerReport};
pub use metrics::MetricsCollector;
pub use pool::{Admission, Job, WorkerPool};
pub use runner::{RunState, TestRunner};
pub use snapshot::{PoolGauges, create_snapshot};
pub use stats::Stats;
pub use user::{UserReport, UserState, VirtualUser};
