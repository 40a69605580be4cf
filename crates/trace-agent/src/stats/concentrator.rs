//! The concentrator aggregates processed traces into time buckets.
//!
//! Each top-level span lands in the bucket its start time falls into; the
//! bucket keeps weighted hit/error/duration counters and duration
//! distributions per aggregation key. Flushing returns every bucket old
//! enough that late spans can no longer reach it (one extra bucket of
//! tolerance) and leaves younger buckets in place.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use super::{AggregationKey, GroupedStats, StatsBucket};
use crate::model::ProcessedTrace;

/// Time-bucketed aggregator of span statistics.
pub struct Concentrator {
    /// Bucket width, nanoseconds.
    bucket_interval_ns: i64,
    /// Meta keys whose values become extra aggregation dimensions.
    extra_aggregators: Vec<String>,
    /// Hostname stamped on every key; payload identity.
    hostname: String,
    buckets: Mutex<BTreeMap<i64, StatsBucket>>,
}

impl Concentrator {
    pub fn new(bucket_interval_ns: i64, extra_aggregators: Vec<String>, hostname: String) -> Self {
        Self {
            bucket_interval_ns,
            extra_aggregators,
            hostname,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    fn key_for(&self, pt: &ProcessedTrace, span_idx: usize) -> AggregationKey {
        let span = &pt.trace[span_idx];
        let extra_tags = self
            .extra_aggregators
            .iter()
            .filter_map(|tag| {
                span.meta
                    .get(tag)
                    .map(|value| (tag.clone(), value.clone()))
            })
            .collect();
        AggregationKey {
            resource: span.resource.clone(),
            service: span.service.clone(),
            name: span.name.clone(),
            span_type: span.span_type.clone(),
            env: pt.env.clone(),
            hostname: self.hostname.clone(),
            sublayer: None,
            extra_tags,
        }
    }

    /// Adds every top-level span of the trace to its bucket, plus the root's
    /// sublayer series.
    pub fn add(&self, pt: &ProcessedTrace) {
        let mut buckets = self.buckets.lock().expect("concentrator lock poisoned");
        for (i, span) in pt.trace.iter().enumerate() {
            if !span.is_top_level() {
                continue;
            }
            let weight = span.weight();
            let start = align(span.start, self.bucket_interval_ns);
            let bucket = buckets
                .entry(start)
                .or_insert_with(|| StatsBucket::new(start, self.bucket_interval_ns));

            let duration = span.duration as f64;
            let stats = bucket.counts.entry(self.key_for(pt, i)).or_default();
            stats.hits += weight;
            stats.top_level_hits += weight;
            if span.is_error() {
                stats.errors += weight;
            }
            stats.duration_sum += weight * duration;
            stats.duration_distribution.add(duration, weight);
            stats.top_level_duration_distribution.add(duration, weight);
        }

        self.add_sublayers(&mut buckets, pt);
    }

    /// Sublayer durations are recorded against the root's dimensions with
    /// the sublayer tag appended. They carry duration only: hits stay zero
    /// so hit totals keep counting spans, not decompositions.
    fn add_sublayers(&self, buckets: &mut BTreeMap<i64, StatsBucket>, pt: &ProcessedTrace) {
        let root = pt.root();
        let weight = pt.weight();
        let start = align(root.start, self.bucket_interval_ns);
        for sublayer in &pt.sublayers {
            let Some(tag) = &sublayer.tag else {
                continue;
            };
            let mut key = self.key_for(pt, pt.root);
            key.sublayer = Some(tag.clone());
            let bucket = buckets
                .entry(start)
                .or_insert_with(|| StatsBucket::new(start, self.bucket_interval_ns));
            let stats = bucket.counts.entry(key).or_insert_with(GroupedStats::default);
            stats.duration_sum += weight * sublayer.value;
        }
    }

    /// Returns every bucket closed for longer than one extra interval and
    /// removes it from the state. Younger buckets keep accepting late spans.
    ///
    /// A bucket flushes exactly when `start + 2 * interval < now`; the
    /// cutoff is applied raw, not bucket-aligned, so an unaligned `now`
    /// cannot hold a closed bucket back for a whole extra interval.
    pub fn flush(&self, now_ns: i64) -> Vec<StatsBucket> {
        let cutoff = now_ns - 2 * self.bucket_interval_ns;
        let mut buckets = self.buckets.lock().expect("concentrator lock poisoned");
        let keep = buckets.split_off(&cutoff);
        let flushed: Vec<StatsBucket> = std::mem::replace(&mut *buckets, keep)
            .into_values()
            .collect();
        if !flushed.is_empty() {
            debug!("concentrator flushed {} buckets", flushed.len());
        }
        flushed
    }
}

fn align(ts: i64, interval: i64) -> i64 {
    ts - ts.rem_euclid(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sublayers::compute_sublayers;
    use crate::model::testutil::span_with;
    use crate::model::{trace, Span};

    const BUCKET: i64 = 10_000_000_000; // 10s

    fn concentrator() -> Concentrator {
        Concentrator::new(BUCKET, vec![], "test-host".to_string())
    }

    fn processed(mut spans: Vec<Span>) -> ProcessedTrace {
        trace::compute_top_level(&mut spans);
        let root = trace::root_index(&spans).unwrap();
        let sublayers = compute_sublayers(&spans);
        trace::compute_weight(&mut spans, root);
        ProcessedTrace {
            trace: spans,
            root,
            env: "test".to_string(),
            sublayers,
        }
    }

    fn span_at(trace_id: u64, span_id: u64, parent_id: u64, start: i64) -> Span {
        let mut span = span_with(trace_id, span_id, parent_id, "shop", "request", "/buy");
        span.start = start;
        span.duration = 1_000_000;
        span
    }

    #[test]
    fn test_hits_conservation() {
        let c = concentrator();
        let start = 50 * BUCKET;
        // Two traces, one top-level span each: the child shares the root's
        // service so only roots count.
        let mut other = span_at(2, 21, 0, start);
        other.service = "db".to_string();
        c.add(&processed(vec![
            span_at(1, 11, 0, start),
            span_at(1, 12, 11, start),
        ]));
        c.add(&processed(vec![other]));

        let buckets = c.flush(start + 3 * BUCKET);
        let total: f64 = buckets.iter().map(StatsBucket::total_hits).sum();
        assert_eq!(total, 2.0);
    }

    #[test]
    fn test_weighted_hits() {
        let c = concentrator();
        let start = 50 * BUCKET;
        let mut root = span_at(1, 11, 0, start);
        root.apply_sample_rate(0.25);
        c.add(&processed(vec![root]));

        let buckets = c.flush(start + 3 * BUCKET);
        assert_eq!(buckets.len(), 1);
        let total: f64 = buckets[0].total_hits();
        assert_eq!(total, 4.0);
    }

    #[test]
    fn test_error_and_duration_aggregation() {
        let c = concentrator();
        let start = 50 * BUCKET;
        let mut root = span_at(1, 11, 0, start);
        root.error = 1;
        c.add(&processed(vec![root]));

        let buckets = c.flush(start + 3 * BUCKET);
        let stats = buckets[0]
            .counts
            .values()
            .find(|s| s.hits > 0.0)
            .unwrap();
        assert_eq!(stats.errors, 1.0);
        assert_eq!(stats.duration_sum, 1_000_000.0);
        assert_eq!(stats.duration_distribution.count(), 1.0);
    }

    #[test]
    fn test_flush_respects_late_tolerance() {
        let c = concentrator();
        let start = 50 * BUCKET;
        c.add(&processed(vec![span_at(1, 11, 0, start)]));

        // One interval later the bucket is still within tolerance.
        assert!(c.flush(start + BUCKET).is_empty());
        // Two full intervals later it flushes, exactly once.
        assert_eq!(c.flush(start + 3 * BUCKET).len(), 1);
        assert!(c.flush(start + 3 * BUCKET).is_empty());
    }

    #[test]
    fn test_flush_with_unaligned_now() {
        let c = concentrator();
        let start = 50 * BUCKET;
        c.add(&processed(vec![span_at(1, 11, 0, start)]));

        // start + 2*B == now: not yet flushable, even off-grid.
        assert!(c.flush(start + 2 * BUCKET).is_empty());
        // One nanosecond past the tolerance window, with `now` deliberately
        // off the bucket grid: the bucket must flush.
        assert_eq!(c.flush(start + 2 * BUCKET + 1).len(), 1);
    }

    #[test]
    fn test_late_span_lands_in_open_bucket() {
        let c = concentrator();
        let start = 50 * BUCKET;
        c.add(&processed(vec![span_at(1, 11, 0, start)]));
        assert!(c.flush(start + BUCKET).is_empty());
        // A late span for the same window still aggregates.
        c.add(&processed(vec![span_at(2, 21, 0, start + 1)]));
        let buckets = c.flush(start + 3 * BUCKET);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total_hits(), 2.0);
    }

    #[test]
    fn test_sublayer_series_carry_no_hits() {
        let c = concentrator();
        let start = 50 * BUCKET;
        let mut root = span_at(1, 11, 0, start);
        root.span_type = "web".to_string();
        let mut child = span_at(1, 12, 11, start);
        child.span_type = "sql".to_string();
        child.service = "db".to_string();
        c.add(&processed(vec![root, child]));

        let buckets = c.flush(start + 3 * BUCKET);
        let sublayer_keys: Vec<&AggregationKey> = buckets[0]
            .counts
            .keys()
            .filter(|k| k.sublayer.is_some())
            .collect();
        assert!(!sublayer_keys.is_empty());
        for key in sublayer_keys {
            let stats = &buckets[0].counts[key];
            assert_eq!(stats.hits, 0.0);
            assert!(stats.duration_sum > 0.0);
        }
        // Hit conservation still holds: root + top-level child.
        assert_eq!(buckets[0].total_hits(), 2.0);
    }

    #[test]
    fn test_extra_aggregators_split_series() {
        let c = Concentrator::new(BUCKET, vec!["version".to_string()], "h".to_string());
        let start = 50 * BUCKET;
        let mut v1 = span_at(1, 11, 0, start);
        v1.meta.insert("version".to_string(), "v1".to_string());
        let mut v2 = span_at(2, 21, 0, start);
        v2.meta.insert("version".to_string(), "v2".to_string());
        c.add(&processed(vec![v1]));
        c.add(&processed(vec![v2]));

        let buckets = c.flush(start + 3 * BUCKET);
        let keys: Vec<String> = buckets[0].counts.keys().map(AggregationKey::grain).collect();
        assert!(keys.iter().any(|k| k.contains("version:v1")));
        assert!(keys.iter().any(|k| k.contains("version:v2")));
    }

    #[test]
    fn test_spans_spread_across_buckets() {
        let c = concentrator();
        let start = 50 * BUCKET;
        c.add(&processed(vec![span_at(1, 11, 0, start)]));
        c.add(&processed(vec![span_at(2, 21, 0, start + BUCKET)]));
        let buckets = c.flush(start + 10 * BUCKET);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].start_ns, start);
        assert_eq!(buckets[1].start_ns, start + BUCKET);
    }
}
