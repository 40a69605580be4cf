//! Agent configuration.
//!
//! Defaults live in code; `TRACE_AGENT_*` environment variables override
//! them. Values that fail to parse are logged and fall back to the default:
//! a typo in one variable must not keep the agent from starting.

use std::time::Duration;

use tracing::warn;

use crate::proc;

/// Everything the core pipeline can be tuned with.
#[derive(Clone, Debug)]
pub struct Config {
    /// Host identity stamped on outgoing payloads.
    pub hostname: String,
    /// Environment applied to traces that do not carry one.
    pub default_env: String,
    /// Stats bucket width. Also the base of the staleness threshold and the
    /// flush tick period.
    pub bucket_interval: Duration,
    /// Extra meta keys contributing aggregation dimensions.
    pub extra_aggregators: Vec<String>,
    /// Resource blacklist patterns for the filter chain.
    pub ignored_resources: Vec<String>,
    /// Ceiling for the dynamic pre-sampler.
    pub pre_sample_rate: f64,
    /// Watchdog CPU target, in cores. 0 disables CPU-driven pre-sampling.
    pub max_cpu: f64,
    /// Watchdog memory kill threshold, bytes. 0 disables.
    pub max_memory: u64,
    /// Watchdog connection kill threshold. 0 disables.
    pub max_connections: u64,
    pub watchdog_interval: Duration,
    /// TTL of entries in the rate-by-service table.
    pub priority_sampler_timeout: Duration,
    /// Retention target of the score sampler, traces per second.
    pub score_target_tps: f64,
    /// Retention target of the priority sampler, traces per second.
    pub priority_target_tps: f64,
    /// Backbone decay tick period.
    pub decay_period: Duration,
    /// Score multiplier applied each decay tick, in (0, 1).
    pub decay_factor: f64,
    /// Capacity of the bounded ingest channels.
    pub trace_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: proc::hostname(),
            default_env: "none".to_string(),
            bucket_interval: Duration::from_secs(10),
            extra_aggregators: Vec::new(),
            ignored_resources: Vec::new(),
            pre_sample_rate: 1.0,
            max_cpu: 0.0,
            max_memory: 0,
            max_connections: 0,
            watchdog_interval: Duration::from_secs(10),
            priority_sampler_timeout: Duration::from_secs(20 * 60),
            score_target_tps: 10.0,
            priority_target_tps: 10.0,
            decay_period: Duration::from_secs(5),
            decay_factor: 0.9,
            trace_channel_capacity: 1_000,
        }
    }
}

impl Config {
    /// Loads the configuration from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(hostname) = read_string("TRACE_AGENT_HOSTNAME") {
            config.hostname = hostname;
        }
        if let Some(env) = read_string("TRACE_AGENT_ENV") {
            config.default_env = env;
        }
        if let Some(secs) = read_parsed::<u64>("TRACE_AGENT_BUCKET_INTERVAL_SECS") {
            if secs > 0 {
                config.bucket_interval = Duration::from_secs(secs);
            }
        }
        if let Some(list) = read_string("TRACE_AGENT_EXTRA_AGGREGATORS") {
            config.extra_aggregators = split_list(&list);
        }
        if let Some(list) = read_string("TRACE_AGENT_IGNORED_RESOURCES") {
            config.ignored_resources = split_list(&list);
        }
        if let Some(rate) = read_parsed::<f64>("TRACE_AGENT_PRE_SAMPLE_RATE") {
            config.pre_sample_rate = rate.clamp(0.0, 1.0);
        }
        if let Some(cpu) = read_parsed::<f64>("TRACE_AGENT_MAX_CPU") {
            config.max_cpu = cpu.max(0.0);
        }
        if let Some(bytes) = read_parsed::<u64>("TRACE_AGENT_MAX_MEMORY") {
            config.max_memory = bytes;
        }
        if let Some(conns) = read_parsed::<u64>("TRACE_AGENT_MAX_CONNECTIONS") {
            config.max_connections = conns;
        }
        if let Some(secs) = read_parsed::<u64>("TRACE_AGENT_WATCHDOG_INTERVAL_SECS") {
            if secs > 0 {
                config.watchdog_interval = Duration::from_secs(secs);
            }
        }
        if let Some(secs) = read_parsed::<u64>("TRACE_AGENT_PRIORITY_SAMPLER_TIMEOUT_SECS") {
            if secs > 0 {
                config.priority_sampler_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(tps) = read_parsed::<f64>("TRACE_AGENT_SCORE_TARGET_TPS") {
            if tps > 0.0 {
                config.score_target_tps = tps;
            }
        }
        if let Some(tps) = read_parsed::<f64>("TRACE_AGENT_PRIORITY_TARGET_TPS") {
            if tps > 0.0 {
                config.priority_target_tps = tps;
            }
        }
        config
    }

    /// Bucket width in nanoseconds, the unit the concentrator works in.
    #[allow(clippy::cast_possible_wrap)]
    pub fn bucket_interval_ns(&self) -> i64 {
        self.bucket_interval.as_nanos() as i64
    }
}

fn read_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = read_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bucket_interval, Duration::from_secs(10));
        assert_eq!(config.default_env, "none");
        assert_eq!(config.pre_sample_rate, 1.0);
        assert_eq!(config.max_memory, 0);
        assert!(!config.hostname.is_empty());
    }

    #[test]
    fn test_bucket_interval_ns() {
        let config = Config::default();
        assert_eq!(config.bucket_interval_ns(), 10_000_000_000);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_env_overrides() {
        // Env vars are process-global; use keys no other test touches.
        std::env::set_var("TRACE_AGENT_ENV", "staging");
        std::env::set_var("TRACE_AGENT_MAX_CONNECTIONS", "450");
        std::env::set_var("TRACE_AGENT_PRE_SAMPLE_RATE", "2.5");
        std::env::set_var("TRACE_AGENT_SCORE_TARGET_TPS", "not-a-number");
        let config = Config::from_env();
        std::env::remove_var("TRACE_AGENT_ENV");
        std::env::remove_var("TRACE_AGENT_MAX_CONNECTIONS");
        std::env::remove_var("TRACE_AGENT_PRE_SAMPLE_RATE");
        std::env::remove_var("TRACE_AGENT_SCORE_TARGET_TPS");

        assert_eq!(config.default_env, "staging");
        assert_eq!(config.max_connections, 450);
        // Out-of-range rate clamped, unparsable value falls back.
        assert_eq!(config.pre_sample_rate, 1.0);
        assert_eq!(config.score_target_tps, 10.0);
    }
}
