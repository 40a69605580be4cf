//! Watchdog over the agent's own resource usage.
//!
//! Every tick it samples the process, kills the agent when memory or
//! connection ceilings are breached (a runaway agent must never take the
//! host down with it), and feeds the observed CPU into the pre-sampler so
//! admission shrinks before CPU becomes a problem.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::proc::{self, ProcessInfo};
use crate::sampler::presampler::{calc_pre_sample_rate, PreSampler};

/// Hook invoked on a fatal resource breach. The default exits the process;
/// tests substitute their own.
pub type DieHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Default fatal handler: log and exit. Termination is deliberate; the
/// operator is expected to investigate, not the agent to limp on.
pub fn default_die() -> DieHook {
    Arc::new(|cause| {
        error!("fatal: {cause}");
        std::process::exit(1);
    })
}

/// One watchdog reading, exposed for operational introspection.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WatchdogInfo {
    /// Average user CPU over the last tick interval, in cores.
    pub cpu_user_avg: f64,
    /// Resident memory, bytes.
    pub rss_bytes: u64,
    /// Open socket count.
    pub connections: u64,
}

/// Periodic resource monitor driving the pre-sampler.
pub struct Watchdog {
    max_memory: u64,
    max_connections: u64,
    max_cpu: f64,
    pre_sample_ceiling: f64,
    pre_sampler: Arc<PreSampler>,
    die: DieHook,
    /// Previous CPU sample, for averaging across ticks.
    last_cpu: Option<(Instant, f64)>,
    last_info: WatchdogInfo,
    /// Injected sampler so tests can feed synthetic readings.
    sample_fn: fn() -> ProcessInfo,
}

impl Watchdog {
    pub fn new(config: &Config, pre_sampler: Arc<PreSampler>, die: DieHook) -> Self {
        Self {
            max_memory: config.max_memory,
            max_connections: config.max_connections,
            max_cpu: config.max_cpu,
            pre_sample_ceiling: config.pre_sample_rate,
            pre_sampler,
            die,
            last_cpu: None,
            last_info: WatchdogInfo::default(),
            sample_fn: proc::sample,
        }
    }

    /// Latest reading, for the info endpoint.
    pub fn info(&self) -> WatchdogInfo {
        self.last_info
    }

    /// One watchdog pass: sample, enforce hard ceilings, adjust the gate.
    pub fn tick(&mut self) {
        let info = (self.sample_fn)();
        let now = Instant::now();
        let cpu_user_avg = match self.last_cpu {
            Some((at, cpu_secs)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    ((info.cpu_user_secs - cpu_secs) / elapsed).max(0.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((now, info.cpu_user_secs));
        self.last_info = WatchdogInfo {
            cpu_user_avg,
            rss_bytes: info.rss_bytes,
            connections: info.connections,
        };

        if self.max_memory > 0 && info.rss_bytes > self.max_memory {
            (self.die)(&format!(
                "exceeded max memory (current={}, max={})",
                info.rss_bytes, self.max_memory
            ));
            return;
        }
        if self.max_connections > 0 && info.connections > self.max_connections {
            (self.die)(&format!(
                "exceeded max connections (current={}, max={})",
                info.connections, self.max_connections
            ));
            return;
        }

        if self.max_cpu <= 0.0 {
            return;
        }
        match calc_pre_sample_rate(self.max_cpu, cpu_user_avg, self.pre_sampler.real_rate()) {
            Ok(rate) => {
                let rate = rate.min(self.pre_sample_ceiling);
                if rate < 1.0 {
                    info!("pre-sampling at rate {rate:.3} (cpu={cpu_user_avg:.3})");
                }
                self.pre_sampler.set_rate(rate);
                self.pre_sampler.set_error(None);
            }
            Err(err) => {
                warn!("problem computing pre-sample rate: {err}");
                self.pre_sampler.set_error(Some(err.to_string()));
            }
        }
    }

    #[cfg(test)]
    fn with_sampler(mut self, sample_fn: fn() -> ProcessInfo) -> Self {
        self.sample_fn = sample_fn;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(max_memory: u64, max_connections: u64, max_cpu: f64) -> Config {
        Config {
            max_memory,
            max_connections,
            max_cpu,
            pre_sample_rate: 1.0,
            ..Config::default()
        }
    }

    fn recording_die() -> (DieHook, Arc<AtomicBool>) {
        let died = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&died);
        let hook: DieHook = Arc::new(move |_| flag.store(true, Ordering::SeqCst));
        (hook, died)
    }

    fn hot_process() -> ProcessInfo {
        ProcessInfo {
            cpu_user_secs: 1_000.0,
            rss_bytes: 4 << 30,
            connections: 10_000,
        }
    }

    fn quiet_process() -> ProcessInfo {
        ProcessInfo {
            cpu_user_secs: 0.0,
            rss_bytes: 10 << 20,
            connections: 3,
        }
    }

    #[test]
    fn test_memory_breach_dies() {
        let (die, died) = recording_die();
        let mut watchdog = Watchdog::new(&config(1 << 30, 0, 0.0), Arc::new(PreSampler::new()), die)
            .with_sampler(hot_process);
        watchdog.tick();
        assert!(died.load(Ordering::SeqCst));
    }

    #[test]
    fn test_connection_breach_dies() {
        let (die, died) = recording_die();
        let mut watchdog = Watchdog::new(&config(0, 100, 0.0), Arc::new(PreSampler::new()), die)
            .with_sampler(hot_process);
        watchdog.tick();
        assert!(died.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_thresholds_disable_kills() {
        let (die, died) = recording_die();
        let mut watchdog = Watchdog::new(&config(0, 0, 0.0), Arc::new(PreSampler::new()), die)
            .with_sampler(hot_process);
        watchdog.tick();
        assert!(!died.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quiet_process_keeps_full_rate() {
        let (die, _) = recording_die();
        let pre_sampler = Arc::new(PreSampler::new());
        let mut watchdog =
            Watchdog::new(&config(0, 0, 0.5), Arc::clone(&pre_sampler), die)
                .with_sampler(quiet_process);
        watchdog.tick();
        watchdog.tick();
        assert_eq!(pre_sampler.rate(), 1.0);
        assert_eq!(pre_sampler.error(), None);
    }

    #[test]
    fn test_rate_respects_configured_ceiling() {
        let (die, _) = recording_die();
        let pre_sampler = Arc::new(PreSampler::new());
        let mut config = config(0, 0, 0.5);
        config.pre_sample_rate = 0.8;
        let mut watchdog = Watchdog::new(&config, Arc::clone(&pre_sampler), die)
            .with_sampler(quiet_process);
        watchdog.tick();
        assert!(pre_sampler.rate() <= 0.8);
    }
}
