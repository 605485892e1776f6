use crate::error::{Error, Result};
use crate::types::{
    BackpressurePolicy, Endpoint, PoolConfig, ThinkTime, WorkloadConfig, WorkloadMode,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadSettings,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub url: Option<String>,
    pub method: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoadSettings {
    pub mode: Option<WorkloadMode>,
    pub concurrency: Option<u32>,
    pub rate: Option<f64>,
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub think_time: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub think_time_max: Option<Duration>,
    pub capacity: Option<u32>,
    pub queue: Option<u32>,
    pub backpressure: Option<BackpressurePolicy>,
    #[serde(default, with = "humantime_serde::option")]
    pub grace_period: Option<Duration>,
    pub max_requests: Option<u64>,
}

/// Values given on the command line. Each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub mode: Option<WorkloadMode>,
    pub concurrency: Option<u32>,
    pub rate: Option<f64>,
    pub duration: Option<Duration>,
    pub think_time: Option<Duration>,
    pub think_time_max: Option<Duration>,
    pub capacity: Option<u32>,
    pub queue: Option<u32>,
    pub backpressure: Option<BackpressurePolicy>,
    pub grace_period: Option<Duration>,
    pub timeout: Option<Duration>,
    pub max_requests: Option<u64>,
}

pub fn load_config(path: &Path) -> Result<TomlConfig> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<TomlConfig> {
    let content = interpolate_env_vars(content)?;
    toml::from_str(&content).map_err(|e| Error::config(format!("failed to parse config file: {}", e)))
}

fn interpolate_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}").map_err(|e| Error::config(e.to_string()))?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_expr)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_expr = var_expr.as_str();

        let (var_name, default) = match var_expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (var_expr, None),
        };

        let value = match std::env::var(var_name) {
            Ok(v) => v,
            Err(_) => match default {
                Some(d) => d.to_string(),
                None => {
                    return Err(Error::config(format!(
                        "environment variable '{}' not set",
                        var_name
                    )));
                }
            },
        };

        result = result.replace(full_match.as_str(), &value);
    }

    Ok(result)
}

/// Merge command-line overrides over an optional file into a validated
/// workload.
pub fn build_workload(overrides: &Overrides, file: Option<TomlConfig>) -> Result<WorkloadConfig> {
    let file = file.unwrap_or_default();
    let load = file.load;

    let url = overrides
        .url
        .clone()
        .or(file.target.url)
        .ok_or_else(|| Error::config("URL is required. Provide via argument or config file."))?;

    let method_str = overrides
        .method
        .clone()
        .or(file.target.method)
        .unwrap_or_else(|| "GET".to_string());
    let method: reqwest::Method = method_str
        .to_uppercase()
        .parse()
        .map_err(|_| Error::config(format!("invalid HTTP method: {}", method_str)))?;

    let concurrency = overrides.concurrency.or(load.concurrency);
    let rate = overrides.rate.or(load.rate);
    let mode = match overrides.mode.or(load.mode) {
        Some(mode) => mode,
        None => match (concurrency, rate) {
            (Some(_), None) => WorkloadMode::ClosedLoop,
            (None, Some(_)) => WorkloadMode::OpenLoop,
            (Some(_), Some(_)) => {
                return Err(Error::config(
                    "both concurrency and rate given; set mode to choose one",
                ));
            }
            (None, None) => {
                return Err(Error::config(
                    "either concurrency (closed loop) or rate (open loop) is required",
                ));
            }
        },
    };

    let duration = overrides.duration.or(load.duration).unwrap_or(DEFAULT_DURATION);
    let mut config = match mode {
        WorkloadMode::ClosedLoop => {
            if rate.is_some() {
                return Err(Error::config("rate only applies to open-loop mode"));
            }
            let concurrency =
                concurrency.ok_or_else(|| Error::config("concurrency is required in closed-loop mode"))?;
            WorkloadConfig::closed_loop(&url, concurrency, duration)
        }
        WorkloadMode::OpenLoop => {
            if concurrency.is_some() {
                return Err(Error::config(
                    "concurrency only applies to closed-loop mode; use capacity to bound in-flight requests",
                ));
            }
            let rate = rate.ok_or_else(|| Error::config("rate is required in open-loop mode"))?;
            WorkloadConfig::open_loop(&url, rate, duration)
        }
    };
    config.target = Endpoint::get(&url).with_method(method);

    let think_min = overrides.think_time.or(load.think_time).unwrap_or(Duration::ZERO);
    config.think_time = match overrides.think_time_max.or(load.think_time_max) {
        Some(max) => ThinkTime::Uniform { min: think_min, max },
        None => ThinkTime::Fixed(think_min),
    };

    let defaults = PoolConfig::default();
    config.pool = PoolConfig {
        capacity: overrides.capacity.or(load.capacity),
        queue_capacity: overrides.queue.or(load.queue).unwrap_or(defaults.queue_capacity),
        backpressure: overrides.backpressure.or(load.backpressure).unwrap_or(defaults.backpressure),
    };

    if let Some(grace) = overrides.grace_period.or(load.grace_period) {
        config.grace_period = grace;
    }
    if let Some(timeout) = overrides.timeout.or(file.target.timeout) {
        config.request_timeout = timeout;
    }
    config.max_requests = overrides.max_requests.or(load.max_requests).unwrap_or(0);

    config.validate()?;
    Ok(config)
}
