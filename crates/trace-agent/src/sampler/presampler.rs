//! Admission gate in front of the whole pipeline.
//!
//! The transport asks the pre-sampler before decoding work is committed; the
//! watchdog moves the rate with CPU pressure. Dropping here is uniform and
//! cheap: refused payloads only show up in the pre-sampler's own counters,
//! never downstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Smallest rate the watchdog may drive the gate down to. Keeping a floor
/// guarantees some traffic always gets through, so the observed rate stays
/// measurable and recovery is possible.
pub const RATE_FLOOR: f64 = 0.1;

/// Readings within this fraction of the CPU target leave the rate unchanged.
const DELTA_MIN: f64 = 0.1;

/// Fraction of the distance to the ideal rate covered per adjustment.
const DAMPING: f64 = 0.5;

/// Errors from [`calc_pre_sample_rate`] on infeasible inputs.
#[derive(Debug, Error, PartialEq)]
pub enum PreSampleError {
    #[error("max CPU target must be positive, got {0}")]
    InvalidMaxCpu(f64),
    #[error("observed CPU must be non-negative, got {0}")]
    NegativeCpu(f64),
    #[error("current rate {0} outside (0, 1]")]
    InvalidRate(f64),
}

/// Counters of the traffic the gate has seen and admitted since the last
/// rate change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreSamplerStats {
    pub seen: u64,
    pub kept: u64,
}

#[derive(Default)]
struct GateState {
    rate: f64,
    error: Option<String>,
}

/// Fractional admission gate, adjusted by the watchdog.
pub struct PreSampler {
    state: Mutex<GateState>,
    seen: AtomicU64,
    kept: AtomicU64,
}

impl Default for PreSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl PreSampler {
    /// A fully open gate.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                rate: 1.0,
                error: None,
            }),
            seen: AtomicU64::new(0),
            kept: AtomicU64::new(0),
        }
    }

    /// Decides whether to admit one unit of work.
    pub fn sample(&self) -> bool {
        let rate = self.rate();
        self.seen.fetch_add(1, Ordering::Relaxed);
        let keep = rate >= 1.0 || rand::random::<f64>() < rate;
        if keep {
            self.kept.fetch_add(1, Ordering::Relaxed);
        }
        keep
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().expect("pre-sampler lock poisoned").rate
    }

    /// Publishes a new rate and opens a fresh observation window.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().expect("pre-sampler lock poisoned");
        state.rate = rate.clamp(RATE_FLOOR, 1.0);
        self.seen.store(0, Ordering::Relaxed);
        self.kept.store(0, Ordering::Relaxed);
    }

    /// Records the latest watchdog diagnostic, if any.
    pub fn set_error(&self, error: Option<String>) {
        self.state.lock().expect("pre-sampler lock poisoned").error = error;
    }

    pub fn error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("pre-sampler lock poisoned")
            .error
            .clone()
    }

    /// Accept ratio actually observed in the current window. Falls back to
    /// the configured rate while the window is empty.
    pub fn real_rate(&self) -> f64 {
        let seen = self.seen.load(Ordering::Relaxed);
        if seen == 0 {
            return self.rate();
        }
        self.kept.load(Ordering::Relaxed) as f64 / seen as f64
    }

    pub fn stats(&self) -> PreSamplerStats {
        PreSamplerStats {
            seen: self.seen.load(Ordering::Relaxed),
            kept: self.kept.load(Ordering::Relaxed),
        }
    }
}

/// Computes the next pre-sample rate from the CPU target, the observed user
/// CPU average, and the currently observed accept ratio.
///
/// Pure. The observed CPU and current rate give the CPU cost per unit of
/// rate; the ideal rate is whatever spends exactly the target. The returned
/// rate covers half the distance to the ideal so successive watchdog ticks
/// converge without oscillating, and it never leaves `[RATE_FLOOR, 1.0]`.
/// Readings inside the ±10% deadband around the target return the current
/// rate unchanged.
pub fn calc_pre_sample_rate(
    max_cpu: f64,
    observed_cpu: f64,
    real_rate: f64,
) -> Result<f64, PreSampleError> {
    if max_cpu <= 0.0 {
        return Err(PreSampleError::InvalidMaxCpu(max_cpu));
    }
    if observed_cpu < 0.0 {
        return Err(PreSampleError::NegativeCpu(observed_cpu));
    }
    if real_rate <= 0.0 || real_rate > 1.0 {
        return Err(PreSampleError::InvalidRate(real_rate));
    }
    if observed_cpu == 0.0 {
        // No measurable CPU use: nothing justifies keeping the gate closed.
        return Ok(1.0);
    }
    if (observed_cpu - max_cpu).abs() / max_cpu <= DELTA_MIN {
        return Ok(real_rate.clamp(RATE_FLOOR, 1.0));
    }

    let ideal = real_rate * max_cpu / observed_cpu;
    let next = real_rate + (ideal - real_rate) * DAMPING;
    Ok(next.clamp(RATE_FLOOR, 1.0))
}
