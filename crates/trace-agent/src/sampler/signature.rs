//! Trace fingerprints used to throttle repeated trace shapes.
//!
//! A signature collapses a trace into a 64-bit value that is stable across
//! ids, timings and span counts: two traces made of the same
//! `(service, name, resource, error)` tuples with the same root and
//! environment hash identically. Per-span hashes are sorted and deduplicated
//! before being XOR-folded with the root hash, which makes the non-root
//! contribution order- and multiplicity-independent.

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::model::Span;

/// A 64-bit fingerprint of a trace shape or of a (service, env) pair.
pub type Signature = u64;

fn span_hash(span: &Span) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(span.service.as_bytes());
    hasher.write(b",");
    hasher.write(span.name.as_bytes());
    hasher.write(b",");
    hasher.write(span.resource.as_bytes());
    hasher.write(b",");
    hasher.write(&[u8::from(span.is_error())]);
    hasher.finish()
}

fn root_hash(root: &Span, env: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(env.as_bytes());
    hasher.write(b",");
    hasher.write(span_hash(root).to_be_bytes().as_slice());
    hasher.finish()
}

/// Computes the signature of a whole trace.
pub fn compute_signature(trace: &[Span], root: &Span, env: &str) -> Signature {
    let mut hashes: Vec<u64> = trace.iter().map(span_hash).collect();
    hashes.sort_unstable();
    hashes.dedup();

    let mut signature = root_hash(root, env);
    for hash in hashes {
        signature ^= hash;
    }
    signature
}

/// Computes the lighter service signature: only the root's service and the
/// environment contribute.
pub fn compute_service_signature(root: &Span, env: &str) -> Signature {
    let mut hasher = FnvHasher::default();
    hasher.write(root.service.as_bytes());
    hasher.write(b",");
    hasher.write(env.as_bytes());
    hasher.finish()
}
