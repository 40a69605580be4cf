//! Span and trace model shared across the pipeline.
//!
//! A [`Span`] is the atomic unit of work reported by a tracer; a [`Trace`] is
//! the ordered set of spans sharing one trace id. The transport decodes
//! JSON or MessagePack request bodies directly into these types, so the field
//! names here are the wire names.
//!
//! Sampling state travels inside the span's `metrics` map under the
//! well-known keys below. The typed accessors on [`Span`] are the only
//! sanctioned way to read or write them.

pub mod normalizer;
pub mod sublayers;
pub mod trace;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Span metric set to 1 on service entry spans.
pub const TOP_LEVEL_KEY: &str = "_top_level";
/// Span metric carrying the sampling inflation factor applied during
/// aggregation.
pub const WEIGHT_KEY: &str = "_weight";
/// Span metric carrying the sample rate applied to the trace so far.
/// Multiplicative: client rate, pre-sample rate and sampler rate all fold
/// into it.
pub const SAMPLE_RATE_KEY: &str = "_sample_rate";
/// Span metric carrying the client sampling priority. Set on the root of
/// distributed traces.
pub const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";
/// Meta key carrying the deployment environment.
pub const ENV_KEY: &str = "env";

/// An ordered sequence of spans sharing a single trace id.
pub type Trace = Vec<Span>;

/// A fully prepared trace, as handed across the fan-out to the concentrator
/// and the samplers. After construction the spans are frozen: downstream
/// consumers read them but never write through this handle.
#[derive(Clone, Debug)]
pub struct ProcessedTrace {
    pub trace: Trace,
    /// Index of the root span inside `trace`.
    pub root: usize,
    /// Environment resolved from the root, with the agent default applied.
    pub env: String,
    pub sublayers: Vec<sublayers::SublayerValue>,
}

impl ProcessedTrace {
    pub fn root(&self) -> &Span {
        &self.trace[self.root]
    }

    /// Sampling weight of the whole trace, read off the root.
    pub fn weight(&self) -> f64 {
        self.root().weight()
    }
}

/// A single unit of work reported by a tracer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Span {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    pub service: String,
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub span_type: String,
    /// Start of the span, Unix nanoseconds.
    pub start: i64,
    /// Duration in nanoseconds, strictly positive once normalized.
    pub duration: i64,
    /// 1 if the span carries an error, 0 otherwise.
    pub error: i32,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

impl Span {
    /// End of the span, Unix nanoseconds.
    pub fn end(&self) -> i64 {
        self.start + self.duration
    }

    /// Sampling weight of the span: the inverse of the applied sample rate.
    ///
    /// A missing or out-of-range rate yields 1.0 so unsampled traffic counts
    /// exactly once.
    pub fn weight(&self) -> f64 {
        match self.metrics.get(SAMPLE_RATE_KEY) {
            Some(&rate) if rate > 0.0 && rate <= 1.0 => 1.0 / rate,
            _ => 1.0,
        }
    }

    /// Sample rate applied to the trace so far, if any.
    pub fn sample_rate(&self) -> Option<f64> {
        self.metrics.get(SAMPLE_RATE_KEY).copied()
    }

    /// Folds `rate` into the applied sample rate.
    pub fn apply_sample_rate(&mut self, rate: f64) {
        let applied = self.sample_rate().unwrap_or(1.0) * rate;
        self.metrics.insert(SAMPLE_RATE_KEY.to_string(), applied);
    }

    /// Client sampling priority, when the tracer set one.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sampling_priority(&self) -> Option<i8> {
        self.metrics.get(SAMPLING_PRIORITY_KEY).map(|p| *p as i8)
    }

    /// Whether the span is marked as the entry point of its service.
    pub fn is_top_level(&self) -> bool {
        self.metrics.get(TOP_LEVEL_KEY).is_some_and(|v| *v == 1.0)
    }

    pub(crate) fn set_top_level(&mut self, top_level: bool) {
        if top_level {
            self.metrics.insert(TOP_LEVEL_KEY.to_string(), 1.0);
        } else {
            self.metrics.remove(TOP_LEVEL_KEY);
        }
    }

    pub(crate) fn set_weight(&mut self, weight: f64) {
        self.metrics.insert(WEIGHT_KEY.to_string(), weight);
    }

    pub fn is_error(&self) -> bool {
        self.error != 0
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn now_ns() -> i64 {
        UNIX_EPOCH.elapsed().map(|d| d.as_nanos() as i64).unwrap()
    }

    /// A well-formed span that passes normalization untouched.
    pub(crate) fn test_span() -> Span {
        Span {
            trace_id: 42,
            span_id: 52,
            parent_id: 0,
            service: "fennel".to_string(),
            name: "django.controller".to_string(),
            resource: "fennel.order".to_string(),
            span_type: "web".to_string(),
            start: now_ns() - 1_000_000_000,
            duration: 1_000_000_000,
            error: 0,
            meta: HashMap::from([("env".to_string(), "test".to_string())]),
            metrics: HashMap::from([("cheese_weight".to_string(), 100.0)]),
        }
    }

    pub(crate) fn span_with(
        trace_id: u64,
        span_id: u64,
        parent_id: u64,
        service: &str,
        name: &str,
        resource: &str,
    ) -> Span {
        Span {
            trace_id,
            span_id,
            parent_id,
            service: service.to_string(),
            name: name.to_string(),
            resource: resource.to_string(),
            start: now_ns() - 2_000_000,
            duration: 1_000_000,
            ..Span::default()
        }
    }
}
