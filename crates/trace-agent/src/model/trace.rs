//! Tree operations over a normalized trace.
//!
//! Traces arrive as flat span lists; parent/child structure is rebuilt on
//! demand from id lookups and never stored as owned pointers.

use std::collections::{HashMap, HashSet};

use super::{Span, ENV_KEY};

/// Finds the root of the trace and returns its index.
///
/// The root is the span whose `parent_id` is 0, or whose parent id names no
/// other span in the trace. The scan for an explicit root runs backwards
/// because many clients report the root last. When several spans qualify as
/// orphans the earliest-starting one wins; a degenerate trace falls back to
/// its last span.
pub fn root_index(trace: &[Span]) -> Option<usize> {
    if trace.is_empty() {
        return None;
    }
    for i in (0..trace.len()).rev() {
        if trace[i].parent_id == 0 {
            return Some(i);
        }
    }

    let span_ids: HashSet<u64> = trace.iter().map(|s| s.span_id).collect();
    let mut root: Option<usize> = None;
    for (i, span) in trace.iter().enumerate() {
        if span_ids.contains(&span.parent_id) {
            continue;
        }
        match root {
            Some(r) if trace[r].start <= span.start => {}
            _ => root = Some(i),
        }
    }
    root.or(Some(trace.len() - 1))
}

/// Marks every service entry span in the trace.
///
/// A span is top-level when it has no parent, when its parent is not part of
/// the trace (distributed continuation), or when its parent belongs to a
/// different service (local root of that service's work).
pub fn compute_top_level(trace: &mut [Span]) {
    let mut span_id_idx: HashMap<u64, usize> = HashMap::with_capacity(trace.len());
    for (i, span) in trace.iter().enumerate() {
        span_id_idx.insert(span.span_id, i);
    }
    for i in 0..trace.len() {
        let parent_id = trace[i].parent_id;
        if parent_id == 0 {
            trace[i].set_top_level(true);
            continue;
        }
        match span_id_idx.get(&parent_id).map(|p| trace[*p].service.clone()) {
            Some(parent_service) if parent_service == trace[i].service => {
                trace[i].set_top_level(false);
            }
            _ => trace[i].set_top_level(true),
        }
    }
}

/// Propagates the root's sampling weight to every span.
///
/// Must run before the trace is shared across the fan-out: it writes the
/// metrics maps, which are not safe to mutate concurrently.
pub fn compute_weight(trace: &mut [Span], root: usize) {
    let weight = trace[root].weight();
    for span in trace.iter_mut() {
        span.set_weight(weight);
    }
}

/// Environment the trace was emitted from, read off the root.
pub fn env(trace: &[Span], root: usize) -> Option<&str> {
    trace
        .get(root)
        .and_then(|span| span.meta.get(ENV_KEY))
        .map(String::as_str)
        .filter(|env| !env.is_empty())
}
