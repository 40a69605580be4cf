//! Span and trace normalization.
//!
//! Every decoded trace passes through here before anything else touches it.
//! Normalization either rewrites a span into an invariant-satisfying form
//! (clamped strings, canonical service/env tags, fresh ids where missing) or
//! rejects the whole trace with a typed error the transport converts into a
//! reject counter.

use std::time::UNIX_EPOCH;

use lazy_static::lazy_static;
use thiserror::Error;

use super::{Span, Trace, ENV_KEY};

/// Maximum length of `service`.
pub const MAX_SERVICE_LEN: usize = 100;
/// Maximum length of `name`.
pub const MAX_NAME_LEN: usize = 100;
/// Maximum length of `type`.
pub const MAX_TYPE_LEN: usize = 100;
/// Maximum length of `resource`; longer values are truncated, not rejected.
pub const MAX_RESOURCE_LEN: usize = 5_000;
/// Maximum length of a meta or metrics key; longer keys are truncated.
pub const MAX_ATTR_KEY_LEN: usize = 100;
/// Maximum length of a meta value; longer values are truncated.
pub const MAX_ATTR_VAL_LEN: usize = 5_000;
/// Maximum number of entries kept in each attribute map.
pub const MAX_ATTR_COUNT: usize = 1_024;

/// Oldest acceptable span start relative to agent start.
const MAX_SPAN_AGE_NS: i64 = 365 * 24 * 3600 * 1_000_000_000;
/// How far in the future a span start may lie.
const MAX_SPAN_FUTURE_NS: i64 = 15 * 60 * 1_000_000_000;

lazy_static! {
    /// Process start, Unix nanoseconds. Anchors the lower bound of the
    /// accepted start window.
    static ref AGENT_START_NS: i64 = now_ns();
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn now_ns() -> i64 {
    UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Reasons a span or trace fails normalization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("span has an empty `service`")]
    EmptyService,
    #[error("span `service` longer than {MAX_SERVICE_LEN} characters")]
    ServiceTooLong,
    #[error("span has an empty `name`")]
    EmptyName,
    #[error("span `name` longer than {MAX_NAME_LEN} characters")]
    NameTooLong,
    #[error("span `name` has no valid characters")]
    InvalidName,
    #[error("span has an empty `resource`")]
    EmptyResource,
    #[error("span `type` longer than {MAX_TYPE_LEN} characters")]
    TypeTooLong,
    #[error("span `start` outside the accepted window")]
    InvalidStart,
    #[error("span `duration` must be strictly positive")]
    InvalidDuration,
    #[error("trace has no spans")]
    EmptyTrace,
    #[error("trace mixes several trace ids")]
    TraceIdMismatch,
    #[error("trace repeats span id {0}")]
    DuplicateSpanId(u64),
}

/// Returns a fresh non-zero 63-bit identifier.
fn random_id() -> u64 {
    loop {
        let id = rand::random::<u64>() >> 1;
        if id != 0 {
            return id;
        }
    }
}

/// Normalizes a single span in place.
///
/// Rewrites are applied in field order; the first unrecoverable violation
/// aborts with an error and the span must be considered rejected. The
/// function is idempotent: normalizing an already-normalized span changes
/// nothing.
pub fn normalize_span(span: &mut Span) -> Result<(), NormalizeError> {
    if span.service.is_empty() {
        return Err(NormalizeError::EmptyService);
    }
    if span.service.len() > MAX_SERVICE_LEN {
        return Err(NormalizeError::ServiceTooLong);
    }
    // Service ends up as a tag upstream, so it follows tag canonicalization.
    span.service = normalize_tag(&span.service);

    if span.name.is_empty() {
        return Err(NormalizeError::EmptyName);
    }
    if span.name.len() > MAX_NAME_LEN {
        return Err(NormalizeError::NameTooLong);
    }
    span.name = normalize_name(&span.name)?;

    if span.resource.is_empty() {
        return Err(NormalizeError::EmptyResource);
    }
    if span.resource.len() > MAX_RESOURCE_LEN {
        truncate_in_place(&mut span.resource, MAX_RESOURCE_LEN);
    }

    if span.span_type.len() > MAX_TYPE_LEN {
        return Err(NormalizeError::TypeTooLong);
    }

    if span.trace_id == 0 {
        span.trace_id = random_id();
    }
    if span.span_id == 0 {
        span.span_id = random_id();
    }

    // Zipkin-style degenerate root: parent == span == trace. Clear the
    // parent link, keep the ids.
    if span.parent_id == span.trace_id && span.parent_id == span.span_id {
        span.parent_id = 0;
    }

    if span.duration <= 0 {
        return Err(NormalizeError::InvalidDuration);
    }
    let now = now_ns();
    if span.start < *AGENT_START_NS - MAX_SPAN_AGE_NS || span.start > now + MAX_SPAN_FUTURE_NS {
        return Err(NormalizeError::InvalidStart);
    }

    normalize_attributes(span);
    if let Some(env) = span.meta.get_mut(ENV_KEY) {
        *env = normalize_tag(env);
    }

    Ok(())
}

/// Normalizes a whole trace in place.
///
/// On top of per-span normalization this enforces the structural invariants:
/// the trace is non-empty, carries a single trace id, and never repeats a
/// span id.
pub fn normalize_trace(trace: &mut Trace) -> Result<(), NormalizeError> {
    if trace.is_empty() {
        return Err(NormalizeError::EmptyTrace);
    }
    let trace_id = trace[0].trace_id;
    let mut seen = std::collections::HashSet::with_capacity(trace.len());
    for span in trace.iter_mut() {
        if span.trace_id != trace_id {
            return Err(NormalizeError::TraceIdMismatch);
        }
        if !seen.insert(span.span_id) {
            return Err(NormalizeError::DuplicateSpanId(span.span_id));
        }
        normalize_span(span)?;
    }
    Ok(())
}

/// Clamps attribute keys and values, dropping entries past the count cap.
fn normalize_attributes(span: &mut Span) {
    if span.meta.keys().any(|k| k.len() > MAX_ATTR_KEY_LEN)
        || span.meta.values().any(|v| v.len() > MAX_ATTR_VAL_LEN)
    {
        let meta = std::mem::take(&mut span.meta);
        span.meta = meta
            .into_iter()
            .map(|(k, v)| (truncate_with_ellipsis(k), truncate_value(v)))
            .collect();
    }
    if span.metrics.keys().any(|k| k.len() > MAX_ATTR_KEY_LEN) {
        let metrics = std::mem::take(&mut span.metrics);
        span.metrics = metrics
            .into_iter()
            .map(|(k, v)| (truncate_with_ellipsis(k), v))
            .collect();
    }
    while span.meta.len() > MAX_ATTR_COUNT {
        let Some(key) = span.meta.keys().next().cloned() else {
            break;
        };
        span.meta.remove(&key);
    }
    while span.metrics.len() > MAX_ATTR_COUNT {
        let Some(key) = span.metrics.keys().next().cloned() else {
            break;
        };
        span.metrics.remove(&key);
    }
}

fn truncate_with_ellipsis(key: String) -> String {
    if key.len() <= MAX_ATTR_KEY_LEN {
        return key;
    }
    let mut out = key;
    truncate_in_place(&mut out, MAX_ATTR_KEY_LEN);
    out.push_str("...");
    out
}

fn truncate_value(val: String) -> String {
    if val.len() <= MAX_ATTR_VAL_LEN {
        return val;
    }
    let mut out = val;
    truncate_in_place(&mut out, MAX_ATTR_VAL_LEN);
    out.push_str("...");
    out
}

/// Truncates a string to at most `max` bytes on a char boundary.
fn truncate_in_place(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Canonicalizes a tag value the way the intake expects: lowercase, a
/// restricted character set with everything else mapped to `_`, runs of `_`
/// collapsed, and trailing separators trimmed.
pub fn normalize_tag(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    let mut last_underscore = false;
    for c in tag.chars() {
        let c = c.to_ascii_lowercase();
        let keep = c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || matches!(c, '.' | '/' | '-' | ':' | '_');
        if keep && c != '_' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with(['_', '.', ':', '/', '-']) {
        out.pop();
    }
    out
}

/// Canonicalizes an operation name to ASCII identifier characters plus dots.
fn normalize_name(name: &str) -> Result<String, NormalizeError> {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        return Err(NormalizeError::InvalidName);
    }
    Ok(out)
}
