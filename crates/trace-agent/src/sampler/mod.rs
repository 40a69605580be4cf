//! Trace samplers deciding which complete traces to keep.
//!
//! Two samplers run side by side over disjoint streams: the score sampler
//! handles ordinary traces, the priority sampler handles traces whose tracer
//! set a sampling priority. Both share the same backbone, a
//! signature-scored reservoir with exponential decay, and differ only in
//! their selection gate and in the signature they key the reservoir by
//! (full trace shape for score, service identity for priority).
//!
//! The backbone keeps one decaying score per signature. Every arrival bumps
//! its signature's score; a background task multiplies all scores by the
//! decay factor each period and prunes the ones that faded out. The score is
//! therefore proportional to the signature's arrival rate, and the keep
//! probability `min(1, target_tps / estimated_tps)` throttles frequent
//! shapes while letting rare ones through untouched.

pub mod presampler;
pub mod rate_by_service;
pub mod signature;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::model::{trace, ProcessedTrace, Trace};
use self::rate_by_service::RateByService;
use self::signature::{compute_service_signature, compute_signature, Signature};

/// Scores below this are dropped on the decay tick; the signature starts
/// from scratch on its next arrival.
const SCORE_EPSILON: f64 = 0.01;

/// Tracer-set priorities, as read from the root span.
const PRIORITY_USER_KEEP: i8 = 2;
const PRIORITY_AUTO_KEEP: i8 = 1;
const PRIORITY_USER_REJECT: i8 = -1;

/// Selection gate distinguishing the two samplers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gate {
    /// Backbone decision for every trace.
    Score,
    /// Tracer priority first, backbone for the undecided middle.
    Priority,
}

#[derive(Default)]
struct SamplerState {
    scores: HashMap<Signature, f64>,
    retained: Vec<Trace>,
}

/// A signature-scored reservoir sampler.
pub struct Sampler {
    gate: Gate,
    target_tps: f64,
    decay_period: Duration,
    decay_factor: f64,
    state: Mutex<SamplerState>,
    /// Rate table shared with the transport; only the priority sampler
    /// publishes into it.
    rates: Option<Arc<RateByService>>,
}

impl Sampler {
    /// Sampler for ordinary traces, keyed by the full trace signature.
    pub fn new_score_sampler(config: &Config) -> Self {
        Self {
            gate: Gate::Score,
            target_tps: config.score_target_tps,
            decay_period: config.decay_period,
            decay_factor: config.decay_factor,
            state: Mutex::new(SamplerState::default()),
            rates: None,
        }
    }

    /// Sampler for priority-bearing traces, keyed by the service signature.
    /// Publishes its per-service rates into the shared table so tracers can
    /// converge on them.
    pub fn new_priority_sampler(config: &Config, rates: Arc<RateByService>) -> Self {
        Self {
            gate: Gate::Priority,
            target_tps: config.priority_target_tps,
            decay_period: config.decay_period,
            decay_factor: config.decay_factor,
            state: Mutex::new(SamplerState::default()),
            rates: Some(rates),
        }
    }

    fn signature_of(&self, pt: &ProcessedTrace) -> Signature {
        match self.gate {
            Gate::Score => compute_signature(&pt.trace, pt.root(), &pt.env),
            Gate::Priority => compute_service_signature(pt.root(), &pt.env),
        }
    }

    /// Keep probability for a signature given its current score.
    ///
    /// The score converges on `arrival_tps × window` where the window is the
    /// effective averaging horizon of the decay recurrence.
    fn signature_rate(&self, score: f64) -> f64 {
        let window = self.decay_period.as_secs_f64() / (1.0 - self.decay_factor);
        let estimated_tps = score / window;
        if estimated_tps <= self.target_tps {
            1.0
        } else {
            self.target_tps / estimated_tps
        }
    }

    /// Offers one processed trace to the sampler. Returns whether it was
    /// retained for the next flush.
    ///
    /// Retention copies the trace out of the shared handle and folds the
    /// applied rate into the copy's root, leaving the fan-out's spans
    /// untouched.
    pub fn add(&self, pt: &ProcessedTrace) -> bool {
        let sig = self.signature_of(pt);
        let mut state = self.state.lock().expect("sampler lock poisoned");

        let score = state.scores.entry(sig).or_insert(0.0);
        *score += 1.0;
        let rate = self.signature_rate(*score);

        if let Some(rates) = &self.rates {
            let root = pt.root();
            rates.set_rate(&root.service, &pt.env, rate);
        }

        let decision = match self.gate {
            Gate::Score => Decision::rate(rate),
            Gate::Priority => match pt.root().sampling_priority() {
                Some(p) if p >= PRIORITY_USER_KEEP => Decision::Keep,
                Some(p) if p <= PRIORITY_USER_REJECT => Decision::Drop,
                Some(p) if p == PRIORITY_AUTO_KEEP => Decision::rate(rate),
                // Priority 0: the tracer already sampled this trace out. The
                // arrival still fed the score above so published rates keep
                // converging.
                Some(_) => Decision::Drop,
                None => Decision::rate(rate),
            },
        };

        match decision {
            Decision::Keep => {
                state.retained.push(pt.trace.clone());
                true
            }
            Decision::Sampled(applied_rate) => {
                let mut retained = pt.trace.clone();
                retained[pt.root].apply_sample_rate(applied_rate);
                // The rate just changed, so the weights propagated before
                // fan-out are no longer the inverse of the effective rate.
                trace::compute_weight(&mut retained, pt.root);
                state.retained.push(retained);
                true
            }
            Decision::Drop => false,
        }
    }

    /// Hands back every trace retained since the last flush.
    ///
    /// The retained vector is swapped out under the state lock, so a
    /// concurrent [`add`](Self::add) lands entirely in this flush or
    /// entirely in the next.
    pub fn flush(&self) -> Vec<Trace> {
        let mut state = self.state.lock().expect("sampler lock poisoned");
        std::mem::take(&mut state.retained)
    }

    /// Applies one decay step and prunes faded signatures.
    fn decay(&self) {
        let mut state = self.state.lock().expect("sampler lock poisoned");
        for score in state.scores.values_mut() {
            *score *= self.decay_factor;
        }
        let before = state.scores.len();
        state.scores.retain(|_, score| *score >= SCORE_EPSILON);
        let pruned = before - state.scores.len();
        if pruned > 0 {
            debug!("sampler pruned {pruned} faded signatures");
        }
    }

    /// Background decay loop; runs until the token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.decay_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.decay(),
                () = shutdown.cancelled() => return,
            }
        }
    }

    #[cfg(test)]
    fn score_of(&self, sig: Signature) -> f64 {
        self.state
            .lock()
            .unwrap()
            .scores
            .get(&sig)
            .copied()
            .unwrap_or(0.0)
    }
}

enum Decision {
    Keep,
    Sampled(f64),
    Drop,
}

impl Decision {
    fn rate(rate: f64) -> Self {
        if rate >= 1.0 || rand::random::<f64>() < rate {
            Decision::Sampled(rate)
        } else {
            Decision::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sublayers::compute_sublayers;
    use crate::model::testutil::span_with;
    use crate::model::{trace, SAMPLE_RATE_KEY, SAMPLING_PRIORITY_KEY};

    fn test_config() -> Config {
        Config {
            score_target_tps: 5.0,
            priority_target_tps: 5.0,
            decay_period: Duration::from_secs(5),
            decay_factor: 0.9,
            ..Config::default()
        }
    }

    fn processed(trace_id: u64, service: &str, priority: Option<f64>) -> ProcessedTrace {
        let mut t = vec![
            span_with(trace_id, 1, 0, service, "request", "/checkout"),
            span_with(trace_id, 2, 1, service, "query", "SELECT"),
        ];
        if let Some(p) = priority {
            t[0].metrics.insert(SAMPLING_PRIORITY_KEY.to_string(), p);
        }
        let root = trace::root_index(&t).unwrap();
        let sublayers = compute_sublayers(&t);
        ProcessedTrace {
            trace: t,
            root,
            env: "test".to_string(),
            sublayers,
        }
    }

    #[test]
    fn test_rare_signature_kept_with_rate_one() {
        let sampler = Sampler::new_score_sampler(&test_config());
        let pt = processed(1, "mcnulty", None);
        assert!(sampler.add(&pt));
        let flushed = sampler.flush();
        assert_eq!(flushed.len(), 1);
        // A rare signature samples at rate 1.0, folded into the root.
        assert_eq!(flushed[0][0].metrics.get(SAMPLE_RATE_KEY), Some(&1.0));
    }

    #[test]
    fn test_flood_throttled_to_target() {
        let sampler = Sampler::new_score_sampler(&test_config());
        // Effective window: 5s / (1 - 0.9) = 50s, so the keep probability
        // drops below 1 once a signature's score passes 250.
        let mut kept = 0;
        for i in 0..10_000 {
            let pt = processed(i, "mcnulty", None);
            if sampler.add(&pt) {
                kept += 1;
            }
        }
        assert!(kept < 10_000, "flood was not throttled, kept {kept}");
        assert!(kept > 0);
    }

    #[test]
    fn test_priority_user_keep_always_retained() {
        let config = test_config();
        let rates = Arc::new(RateByService::new(Duration::from_secs(600)));
        let sampler = Sampler::new_priority_sampler(&config, rates);
        for i in 0..5_000 {
            let pt = processed(i, "mcnulty", Some(2.0));
            assert!(sampler.add(&pt), "user-keep trace {i} was dropped");
        }
        assert_eq!(sampler.flush().len(), 5_000);
    }

    #[test]
    fn test_priority_user_reject_always_dropped() {
        let config = test_config();
        let rates = Arc::new(RateByService::new(Duration::from_secs(600)));
        let sampler = Sampler::new_priority_sampler(&config, rates);
        for i in 0..100 {
            let pt = processed(i, "mcnulty", Some(-1.0));
            assert!(!sampler.add(&pt));
        }
        assert!(sampler.flush().is_empty());
    }

    #[test]
    fn test_priority_zero_dropped_but_scored() {
        let config = test_config();
        let rates = Arc::new(RateByService::new(Duration::from_secs(600)));
        let sampler = Sampler::new_priority_sampler(&config, rates);
        let pt = processed(1, "mcnulty", Some(0.0));
        let sig = sampler.signature_of(&pt);
        for i in 0..10 {
            assert!(!sampler.add(&processed(i, "mcnulty", Some(0.0))));
        }
        assert!(sampler.flush().is_empty());
        assert_eq!(sampler.score_of(sig), 10.0);
    }

    #[test]
    fn test_priority_sampler_publishes_rates() {
        let config = test_config();
        let rates = Arc::new(RateByService::new(Duration::from_secs(600)));
        let sampler = Sampler::new_priority_sampler(&config, Arc::clone(&rates));
        sampler.add(&processed(1, "mcnulty", Some(1.0)));
        let all = rates.get_all();
        assert_eq!(all.get("service:mcnulty,env:test"), Some(&1.0));
    }

    #[test]
    fn test_decay_prunes_faded_signatures() {
        let sampler = Sampler::new_score_sampler(&test_config());
        let pt = processed(1, "mcnulty", None);
        let sig = sampler.signature_of(&pt);
        sampler.add(&pt);
        assert_eq!(sampler.score_of(sig), 1.0);
        // 0.9^44 ≈ 0.0097 < epsilon.
        for _ in 0..44 {
            sampler.decay();
        }
        assert_eq!(sampler.score_of(sig), 0.0);
    }

    #[test]
    fn test_sampled_trace_weight_matches_applied_rate() {
        let sampler = Sampler::new_score_sampler(&test_config());
        let mut retained = Vec::new();
        // Flood one signature far past the throttling point so some traces
        // are retained at a rate below 1.
        for i in 0..5_000 {
            sampler.add(&processed(i, "mcnulty", None));
            retained.extend(sampler.flush());
        }
        let throttled: Vec<&Trace> = retained
            .iter()
            .filter(|t| t[0].sample_rate().is_some_and(|r| r < 1.0))
            .collect();
        assert!(!throttled.is_empty(), "flood never throttled");
        for t in throttled {
            let expected = 1.0 / t[0].sample_rate().unwrap();
            for span in t.iter() {
                assert_eq!(span.metrics.get(crate::model::WEIGHT_KEY), Some(&expected));
            }
        }
    }

    #[test]
    fn test_flush_resets_retained() {
        let sampler = Sampler::new_score_sampler(&test_config());
        sampler.add(&processed(1, "mcnulty", None));
        assert_eq!(sampler.flush().len(), 1);
        assert!(sampler.flush().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let sampler = Arc::new(Sampler::new_score_sampler(&test_config()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&sampler).run(token.clone()));
        token.cancel();
        handle.await.unwrap();
    }
}
