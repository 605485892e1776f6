use clap::{Parser, Subcommand, ValueEnum};
use pacer::config::Overrides;
use pacer::{BackpressurePolicy, WorkloadMode};
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if !rate.is_finite() || rate <= 0.0 {
        return Err(format!("rate must be positive, got {}", s));
    }
    Ok(rate)
}

#[derive(Parser, Debug)]
#[command(
    name = "pacer",
    author,
    version,
    about = "HTTP load generator with closed-loop and open-loop scheduling",
    long_about = "pacer drives HTTP traffic at a fixed concurrency (closed loop) or a fixed \
                  arrival rate (open loop) and reports latency with generator queueing \
                  delay kept separate from server time."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load test
    Run(Box<RunArgs>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Target URL to load test
    #[arg(required_unless_present = "config")]
    pub url: Option<String>,

    /// Workload file (TOML)
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Workload model: closed (fixed users) or open (fixed arrival rate)
    #[arg(long)]
    pub mode: Option<WorkloadMode>,

    /// Number of virtual users (closed loop)
    #[arg(short = 'c', long)]
    pub concurrency: Option<u32>,

    /// Target arrival rate in requests per second (open loop)
    #[arg(short = 'r', long, value_parser = parse_rate)]
    pub rate: Option<f64>,

    /// Test duration (e.g., 10s, 1m)
    #[arg(short = 'd', long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Think time between iterations (e.g., 100ms); lower bound when --think-time-max is set
    #[arg(long, value_parser = parse_duration)]
    pub think_time: Option<Duration>,

    /// Upper bound for a uniformly random think time
    #[arg(long, value_parser = parse_duration)]
    pub think_time_max: Option<Duration>,

    /// Max requests in flight at once
    #[arg(long)]
    pub capacity: Option<u32>,

    /// Pending open-loop emissions held while all slots are busy
    #[arg(long)]
    pub queue: Option<u32>,

    /// What to do when the queue is full: block or drop-oldest
    #[arg(long)]
    pub backpressure: Option<BackpressurePolicy>,

    /// How long in-flight requests may finish after the duration ends
    #[arg(long, value_parser = parse_duration)]
    pub grace: Option<Duration>,

    /// Per-request timeout (e.g., 10s)
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// HTTP method
    #[arg(short = 'm', long)]
    pub method: Option<String>,

    /// Stop after this many recorded outcomes
    #[arg(short = 'n', long)]
    pub max_requests: Option<u64>,

    /// Write results to a file
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Output format for --output
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Validate the configuration and exit
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            method: self.method.clone(),
            mode: self.mode,
            concurrency: self.concurrency,
            rate: self.rate,
            duration: self.duration,
            think_time: self.think_time,
            think_time_max: self.think_time_max,
            capacity: self.capacity,
            queue: self.queue,
            backpressure: self.backpressure,
            grace_period: self.grace,
            timeout: self.timeout,
            max_requests: self.max_requests,
        }
    }
}
