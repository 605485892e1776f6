use crate::types::{LatencySummary, MetricsSnapshot, ThinkTime, WorkloadConfig, WorkloadMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(Serialize, Deserialize)]
pub struct JsonOutput {
    pub metadata: Metadata,
    pub summary: Summary,
    pub latency_us: Latencies,
    pub status_codes: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub timeline: Vec<TimelineEntry>,
}

#[derive(Serialize, Deserialize)]
pub struct Metadata {
    pub tool: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub target: Target,
    pub load: Load,
    pub env: Environment,
}

#[derive(Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub method: String,
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Load {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    pub capacity: u32,
    pub queue: u32,
    pub backpressure: String,
    pub think_time_ms: ThinkTimeMs,
    pub grace_period_ms: u64,
    pub max_requests: u64,
}

#[derive(Serialize, Deserialize, Default)]
pub struct ThinkTimeMs {
    pub min: u64,
    pub max: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Environment {
    pub hostname: String,
    pub os: String,
    pub cpus: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Summary {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub backpressured: u64,
    pub blocked_ms: u64,
    pub unadmitted: u64,
    pub error_rate: f64,
    pub requests_per_sec: f64,
    pub in_flight_peak: u32,
}

#[derive(Serialize, Deserialize)]
pub struct Latencies {
    /// Measured by the requester
    pub service: LatencySummary,
    /// Generator-side wait before sending
    pub queue: LatencySummary,
    pub total: LatencySummary,
}

#[derive(Serialize, Deserialize)]
pub struct TimelineEntry {
    pub elapsed_secs: u32,
    pub requests: u64,
    pub errors: u64,
}

pub fn create_output(snapshot: &MetricsSnapshot, config: &WorkloadConfig) -> JsonOutput {
    let now = Utc::now();
    let started_at = now - chrono::Duration::from_std(snapshot.elapsed).unwrap_or_default();

    let status_codes = snapshot
        .status_codes
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();

    let errors = snapshot
        .errors
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), *v))
        .collect();

    let timeline = snapshot
        .timeline
        .iter()
        .map(|b| TimelineEntry {
            elapsed_secs: b.elapsed_secs,
            requests: b.requests,
            errors: b.errors,
        })
        .collect();

    let think_time_ms = match config.think_time {
        ThinkTime::Fixed(d) => ThinkTimeMs {
            min: d.as_millis() as u64,
            max: d.as_millis() as u64,
        },
        ThinkTime::Uniform { min, max } => ThinkTimeMs {
            min: min.as_millis() as u64,
            max: max.as_millis() as u64,
        },
    };

    JsonOutput {
        metadata: Metadata {
            tool: "pacer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
            ended_at: now,
            duration_secs: snapshot.elapsed.as_secs_f64(),
            target: Target {
                url: config.target.url.to_string(),
                method: config.target.method.to_string(),
                timeout_ms: config.request_timeout.as_millis() as u64,
            },
            load: Load {
                mode: config.mode.as_str().to_string(),
                concurrency: (config.mode == WorkloadMode::ClosedLoop).then_some(config.concurrency),
                rate: (config.mode == WorkloadMode::OpenLoop).then_some(config.target_rate),
                capacity: config.pool_capacity(),
                queue: config.pool.queue_capacity,
                backpressure: config.pool.backpressure.as_str().to_string(),
                think_time_ms,
                grace_period_ms: config.grace_period.as_millis() as u64,
                max_requests: config.max_requests,
            },
            env: Environment {
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                os: std::env::consts::OS.to_string(),
                cpus: num_cpus(),
            },
        },
        summary: Summary {
            total_requests: snapshot.total,
            successful: snapshot.successful,
            failed: snapshot.failed,
            dropped: snapshot.dropped,
            abandoned: snapshot.abandoned,
            backpressured: snapshot.backpressured,
            blocked_ms: snapshot.blocked_for.as_millis() as u64,
            unadmitted: snapshot.unadmitted,
            error_rate: snapshot.error_rate,
            requests_per_sec: snapshot.requests_per_sec,
            in_flight_peak: snapshot.in_flight_peak,
        },
        latency_us: Latencies {
            service: snapshot.service.clone(),
            queue: snapshot.queue.clone(),
            total: snapshot.total_latency.clone(),
        },
        status_codes,
        errors,
        timeline,
    }
}

pub fn write_json(snapshot: &MetricsSnapshot, config: &WorkloadConfig, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_json_to(BufWriter::new(file), snapshot, config)
}

pub fn print_json(snapshot: &MetricsSnapshot, config: &WorkloadConfig) -> io::Result<()> {
    let stdout = io::stdout();
    write_json_to(BufWriter::new(stdout.lock()), snapshot, config)?;
    println!();
    Ok(())
}

fn write_json_to<W: Write>(mut writer: W, snapshot: &MetricsSnapshot, config: &WorkloadConfig) -> io::Result<()> {
    let output = create_output(snapshot, config);
    serde_json::to_writer_pretty(&mut writer, &output)?;
    writer.flush()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
