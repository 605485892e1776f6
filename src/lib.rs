//! Closed-loop and open-loop HTTP load generation.
//!
//! A [`TestRunner`] drives either a fixed population of virtual users
//! ([`WorkloadMode::ClosedLoop`]) or a fixed arrival rate
//! ([`WorkloadMode::OpenLoop`]) through a bounded [`WorkerPool`], records
//! every outcome in a [`MetricsCollector`], and reports queueing delay
//! separately from the latency measured by the [`Requester`].

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod output;
pub mod requester;
pub mod types;

pub use engine::{MetricsCollector, TestRunner, WorkerPool};
pub use error::{Error, Result};
pub use http::HttpRequester;
pub use requester::Requester;
pub use types::{
    BackpressurePolicy, Endpoint, ErrorKind, LatencySummary, MetricsSnapshot, OutcomeStatus, PoolConfig, RequestOutcome, RunPhase,
    ThinkTime, WorkloadConfig, WorkloadMode,
};
