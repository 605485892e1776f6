mod cli;

use clap::Parser;
use cli::{Cli, Commands, OutputFormat, RunArgs};
use pacer::config::{build_workload, load_config};
use pacer::output::{write_csv, write_json};
use pacer::{
    HttpRequester, LatencySummary, MetricsSnapshot, TestRunner, ThinkTime, WorkloadConfig,
    WorkloadMode,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> Result<i32, String> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_load_test(&args).await,
    }
}

async fn run_load_test(args: &RunArgs) -> Result<i32, String> {
    let toml_config = match args.config {
        Some(ref path) => Some(load_config(path).map_err(|e| e.to_string())?),
        None => None,
    };

    let config = build_workload(&args.overrides(), toml_config).map_err(|e| e.to_string())?;

    if args.dry_run {
        eprintln!("Configuration validated successfully!\n");
        print_plan(&config);
        return Ok(0);
    }

    let requester = HttpRequester::new(config.pool_capacity(), config.request_timeout)
        .map_err(|e| e.to_string())?;
    let runner = TestRunner::new(Arc::new(requester));
    runner.start(config.clone()).map_err(|e| e.to_string())?;

    let ctrl_c_runner = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping, waiting for in-flight requests...");
            let _ = ctrl_c_runner.stop();
        }
    });

    let snapshot = runner.wait().await.map_err(|e| e.to_string())?;

    print_summary(&snapshot, &config);

    if let Some(path) = &args.output {
        let write_result = match args.format {
            OutputFormat::Json => write_json(&snapshot, &config, path),
            OutputFormat::Csv => write_csv(&snapshot, &config, path),
        };
        write_result.map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        eprintln!("Results written to {}", path.display());
    }

    Ok(0)
}

fn print_plan(config: &WorkloadConfig) {
    eprintln!("Target:      {}", config.target);
    match config.mode {
        WorkloadMode::ClosedLoop => {
            eprintln!("Load Model:  Closed (fixed users)");
            eprintln!("Concurrency: {}", config.concurrency);
        }
        WorkloadMode::OpenLoop => {
            eprintln!("Load Model:  Open (arrival rate)");
            eprintln!("Target RPS:  {}", config.target_rate);
        }
    }
    eprintln!("Duration:    {:?}", config.duration);
    eprintln!(
        "Pool:        {} slots, queue {}, {}",
        config.pool_capacity(),
        config.pool.queue_capacity,
        config.pool.backpressure.as_str()
    );
    match config.think_time {
        ThinkTime::Fixed(d) if d.is_zero() => {}
        ThinkTime::Fixed(d) => eprintln!("Think time:  {:?}", d),
        ThinkTime::Uniform { min, max } => eprintln!("Think time:  {:?}..{:?}", min, max),
    }
    eprintln!("Timeout:     {:?}", config.request_timeout);
    eprintln!("Grace:       {:?}", config.grace_period);
    if config.max_requests > 0 {
        eprintln!("Max Reqs:    {}", config.max_requests);
    }
}

fn print_latency(title: &str, summary: &LatencySummary) {
    let ms = |us: u64| us as f64 / 1000.0;
    println!("\n{} (ms):", title);
    println!("  Min:             {:>12.2}", ms(summary.min_us));
    println!("  Max:             {:>12.2}", ms(summary.max_us));
    println!("  Mean:            {:>12.2}", summary.mean_us / 1000.0);
    println!("  p50:             {:>12.2}", ms(summary.p50_us));
    println!("  p90:             {:>12.2}", ms(summary.p90_us));
    println!("  p95:             {:>12.2}", ms(summary.p95_us));
    println!("  p99:             {:>12.2}", ms(summary.p99_us));
    println!("  p99.9:           {:>12.2}", ms(summary.p999_us));
}

fn print_summary(snapshot: &MetricsSnapshot, config: &WorkloadConfig) {
    println!("\n{}", "=".repeat(50));
    println!("{:^50}", "Load Test Results");
    println!("{}", "=".repeat(50));

    println!("\nThroughput:");
    println!("  Mode:            {:>12}", config.mode.as_str());
    println!("  Total Requests:  {:>12}", snapshot.total);
    println!("  Successful:      {:>12}", snapshot.successful);
    println!("  Failed:          {:>12}", snapshot.failed);
    if snapshot.dropped > 0 {
        println!("  Dropped:         {:>12}", snapshot.dropped);
    }
    if snapshot.abandoned > 0 {
        println!("  Abandoned:       {:>12}", snapshot.abandoned);
    }
    if snapshot.backpressured > 0 || snapshot.unadmitted > 0 {
        println!("  Backpressured:   {:>12}", snapshot.backpressured);
        println!("  Never Admitted:  {:>12}", snapshot.unadmitted);
        println!("  Blocked For:     {:>12}", format!("{:.2?}", snapshot.blocked_for));
    }
    println!("  Requests/sec:    {:>12.2}", snapshot.requests_per_sec);
    println!("  Error Rate:      {:>11.2}%", snapshot.error_rate * 100.0);
    println!("  Peak In-flight:  {:>12}", snapshot.in_flight_peak);

    print_latency("Latency", &snapshot.service);
    if config.mode == WorkloadMode::OpenLoop {
        print_latency("Queue Delay", &snapshot.queue);
    }

    if !snapshot.status_codes.is_empty() {
        println!("\nStatus Codes:");
        let mut codes: Vec<_> = snapshot.status_codes.iter().collect();
        codes.sort_by_key(|(code, _)| **code);
        for (code, count) in codes {
            println!("  {}:              {:>12}", code, count);
        }
    }

    if !snapshot.errors.is_empty() {
        println!("\nErrors:");
        let mut errors: Vec<_> = snapshot.errors.iter().collect();
        errors.sort_by_key(|(kind, _)| **kind);
        for (kind, count) in errors {
            let suggestion = kind.suggestion();
            if suggestion.is_empty() {
                println!("  {:15} {:>12}", format!("{}:", kind.as_str()), count);
            } else {
                println!(
                    "  {:15} {:>12}  ({})",
                    format!("{}:", kind.as_str()),
                    count,
                    suggestion
                );
            }
        }
    }

    println!("\n{}", "=".repeat(50));
}
