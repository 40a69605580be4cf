//! Sublayer decomposition of a trace's duration.
//!
//! A sublayer is the share of the root's total duration attributable to one
//! span type or one service. The decomposition charges every span its
//! exclusive time (own duration minus the time covered by its direct
//! children, floored at zero) and aggregates that by type and by service.
//! The results are written as metrics on the root span only.

use std::collections::HashMap;

use super::Span;

/// Metric prefix for the by-type decomposition; the tag completes the key.
pub const SUBLAYER_DURATION_BY_TYPE: &str = "_sublayers.duration.by_type";
/// Metric prefix for the by-service decomposition.
pub const SUBLAYER_DURATION_BY_SERVICE: &str = "_sublayers.duration.by_service";
/// Metric carrying the number of spans in the trace.
pub const SUBLAYER_SPAN_COUNT: &str = "_sublayers.span_count";

const SUBLAYER_TYPE_TAG: &str = "sublayer_type";
const SUBLAYER_SERVICE_TAG: &str = "sublayer_service";

/// One sublayer measurement: a metric name, the tag narrowing it down, and
/// the measured value.
#[derive(Clone, Debug, PartialEq)]
pub struct SublayerValue {
    pub metric: String,
    pub tag: Option<(String, String)>,
    pub value: f64,
}

impl SublayerValue {
    /// Metric map key this value is stored under on the root span.
    pub fn metric_key(&self) -> String {
        match &self.tag {
            Some((name, value)) => format!("{}.{}:{}", self.metric, name, value),
            None => self.metric.clone(),
        }
    }
}

/// Computes the sublayer decomposition of a trace.
///
/// Output order is deterministic (sorted by tag value) so repeated runs over
/// the same trace produce identical vectors.
pub fn compute_sublayers(trace: &[Span]) -> Vec<SublayerValue> {
    let mut children_duration: HashMap<u64, i64> = HashMap::with_capacity(trace.len());
    for span in trace {
        if span.parent_id != 0 {
            *children_duration.entry(span.parent_id).or_insert(0) += span.duration;
        }
    }

    let mut by_type: HashMap<&str, f64> = HashMap::new();
    let mut by_service: HashMap<&str, f64> = HashMap::new();
    for span in trace {
        let covered = children_duration.get(&span.span_id).copied().unwrap_or(0);
        let exclusive = (span.duration - covered).max(0) as f64;
        if !span.span_type.is_empty() {
            *by_type.entry(span.span_type.as_str()).or_insert(0.0) += exclusive;
        }
        if !span.service.is_empty() {
            *by_service.entry(span.service.as_str()).or_insert(0.0) += exclusive;
        }
    }

    let mut values = Vec::with_capacity(by_type.len() + by_service.len() + 1);
    let mut types: Vec<_> = by_type.into_iter().collect();
    types.sort_by(|a, b| a.0.cmp(b.0));
    for (span_type, duration) in types {
        values.push(SublayerValue {
            metric: SUBLAYER_DURATION_BY_TYPE.to_string(),
            tag: Some((SUBLAYER_TYPE_TAG.to_string(), span_type.to_string())),
            value: duration,
        });
    }
    let mut services: Vec<_> = by_service.into_iter().collect();
    services.sort_by(|a, b| a.0.cmp(b.0));
    for (service, duration) in services {
        values.push(SublayerValue {
            metric: SUBLAYER_DURATION_BY_SERVICE.to_string(),
            tag: Some((SUBLAYER_SERVICE_TAG.to_string(), service.to_string())),
            value: duration,
        });
    }
    values.push(SublayerValue {
        metric: SUBLAYER_SPAN_COUNT.to_string(),
        tag: None,
        value: trace.len() as f64,
    });
    values
}

/// Stores the computed sublayer values on a span's metric map. Called on the
/// root only.
pub fn set_sublayers_on_span(span: &mut Span, sublayers: &[SublayerValue]) {
    for sublayer in sublayers {
        span.metrics.insert(sublayer.metric_key(), sublayer.value);
    }
}
