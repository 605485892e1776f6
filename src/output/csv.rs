use crate::types::{LatencySummary, MetricsSnapshot, WorkloadConfig};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub fn write_csv(snapshot: &MetricsSnapshot, config: &WorkloadConfig, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_csv_content(&mut writer, snapshot, config)
}

pub fn print_csv(snapshot: &MetricsSnapshot, config: &WorkloadConfig) -> io::Result<()> {
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    write_csv_content(&mut writer, snapshot, config)
}

fn write_latency<W: Write>(writer: &mut W, prefix: &str, summary: &LatencySummary) -> io::Result<()> {
    let ms = |us: u64| us as f64 / 1000.0;
    writeln!(writer, "{}_min_ms,{:.3}", prefix, ms(summary.min_us))?;
    writeln!(writer, "{}_max_ms,{:.3}", prefix, ms(summary.max_us))?;
    writeln!(writer, "{}_mean_ms,{:.3}", prefix, summary.mean_us / 1000.0)?;
    writeln!(writer, "{}_p50_ms,{:.3}", prefix, ms(summary.p50_us))?;
    writeln!(writer, "{}_p90_ms,{:.3}", prefix, ms(summary.p90_us))?;
    writeln!(writer, "{}_p95_ms,{:.3}", prefix, ms(summary.p95_us))?;
    writeln!(writer, "{}_p99_ms,{:.3}", prefix, ms(summary.p99_us))?;
    writeln!(writer, "{}_p999_ms,{:.3}", prefix, ms(summary.p999_us))
}

fn write_csv_content<W: Write>(writer: &mut W, snapshot: &MetricsSnapshot, config: &WorkloadConfig) -> io::Result<()> {
    writeln!(writer, "metric,value")?;

    writeln!(writer, "url,\"{}\"", config.target.url)?;
    writeln!(writer, "method,{}", config.target.method)?;
    writeln!(writer, "mode,{}", config.mode.as_str())?;
    writeln!(writer, "capacity,{}", config.pool_capacity())?;
    writeln!(writer, "duration_secs,{:.3}", snapshot.elapsed.as_secs_f64())?;

    writeln!(writer, "total_requests,{}", snapshot.total)?;
    writeln!(writer, "successful,{}", snapshot.successful)?;
    writeln!(writer, "failed,{}", snapshot.failed)?;
    writeln!(writer, "dropped,{}", snapshot.dropped)?;
    writeln!(writer, "abandoned,{}", snapshot.abandoned)?;
    writeln!(writer, "backpressured,{}", snapshot.backpressured)?;
    writeln!(writer, "blocked_ms,{}", snapshot.blocked_for.as_millis())?;
    writeln!(writer, "unadmitted,{}", snapshot.unadmitted)?;
    writeln!(writer, "requests_per_sec,{:.2}", snapshot.requests_per_sec)?;
    writeln!(writer, "error_rate,{:.6}", snapshot.error_rate)?;
    writeln!(writer, "in_flight_peak,{}", snapshot.in_flight_peak)?;

    write_latency(writer, "latency", &snapshot.service)?;
    write_latency(writer, "queue", &snapshot.queue)?;
    write_latency(writer, "total", &snapshot.total_latency)?;

    let mut codes: Vec<_> = snapshot.status_codes.iter().collect();
    codes.sort_by_key(|(code, _)| **code);
    for (code, count) in codes {
        writeln!(writer, "status_{},{}", code, count)?;
    }

    let mut errors: Vec<_> = snapshot.errors.iter().collect();
    errors.sort_by_key(|(kind, _)| **kind);
    for (kind, count) in errors {
        writeln!(writer, "error_{},{}", kind.as_str(), count)?;
    }

    writeln!(writer)?;
    writeln!(writer, "second,requests,errors")?;
    for bucket in &snapshot.timeline {
        writeln!(writer, "{},{},{}", bucket.elapsed_secs, bucket.requests, bucket.errors)?;
    }

    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, TimelineBucket};
    use std::time::Duration;

    #[test]
    fn summary_then_timeline() {
        let config = WorkloadConfig::closed_loop("http://localhost/", 4, Duration::from_secs(2));
        let mut snapshot = MetricsSnapshot {
            total: 3,
            successful: 2,
            failed: 1,
            unadmitted: 4,
            timeline: vec![
                TimelineBucket {
                    elapsed_secs: 0,
                    requests: 2,
                    errors: 0,
                },
                TimelineBucket {
                    elapsed_secs: 1,
                    requests: 1,
                    errors: 1,
                },
            ],
            ..MetricsSnapshot::default()
        };
        snapshot.errors.insert(ErrorKind::Refused, 1);

        let mut buf = Vec::new();
        write_csv_content(&mut buf, &snapshot, &config).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.starts_with("metric,value\n"));
        assert!(text.contains("mode,closed_loop\n"));
        assert!(text.contains("capacity,4\n"));
        assert!(text.contains("error_refused,1\n"));
        assert!(text.contains("unadmitted,4\n"));
        assert!(text.ends_with("second,requests,errors\n0,2,0\n1,1,1\n"));
    }
}
