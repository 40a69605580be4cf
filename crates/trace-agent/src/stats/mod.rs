//! Time-bucketed statistical aggregates over top-level spans.

pub mod concentrator;
pub mod sketch;

use std::collections::HashMap;

use self::sketch::Distribution;

/// Dimensions a span's statistics are aggregated under.
///
/// One key identifies one time series downstream. Sublayer contributions use
/// the same dimensions plus the sublayer tag, so a service's time split
/// lands next to its request counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub resource: String,
    pub service: String,
    pub name: String,
    pub span_type: String,
    pub env: String,
    pub hostname: String,
    /// `(tag name, tag value)` for sublayer series, e.g.
    /// `("sublayer_type", "sql")`.
    pub sublayer: Option<(String, String)>,
    /// Extra aggregation tags configured on the agent, in configured order.
    pub extra_tags: Vec<(String, String)>,
}

impl AggregationKey {
    /// Flat `key:value,…` rendering used by downstream consumers and logs.
    pub fn grain(&self) -> String {
        let mut out = format!(
            "env:{},resource:{},service:{},name:{}",
            self.env, self.resource, self.service, self.name
        );
        if !self.span_type.is_empty() {
            out.push_str(&format!(",type:{}", self.span_type));
        }
        if let Some((tag, value)) = &self.sublayer {
            out.push_str(&format!(",{tag}:{value}"));
        }
        for (tag, value) in &self.extra_tags {
            out.push_str(&format!(",{tag}:{value}"));
        }
        out
    }
}

/// Aggregated counters for one key within one bucket.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupedStats {
    /// Weighted number of spans observed.
    pub hits: f64,
    /// Weighted number of top-level spans observed.
    pub top_level_hits: f64,
    /// Weighted number of spans carrying an error.
    pub errors: f64,
    /// Weighted sum of durations, nanoseconds.
    pub duration_sum: f64,
    pub duration_distribution: Distribution,
    pub top_level_duration_distribution: Distribution,
}

/// All statistics gathered within one fixed-width time window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsBucket {
    /// Start of the window, Unix nanoseconds, aligned on the bucket width.
    pub start_ns: i64,
    /// Width of the window, nanoseconds.
    pub duration_ns: i64,
    pub counts: HashMap<AggregationKey, GroupedStats>,
}

impl StatsBucket {
    pub fn new(start_ns: i64, duration_ns: i64) -> Self {
        Self {
            start_ns,
            duration_ns,
            counts: HashMap::new(),
        }
    }

    /// Total weighted hits across every key in the bucket.
    pub fn total_hits(&self) -> f64 {
        self.counts.values().map(|c| c.hits).sum()
    }
}
