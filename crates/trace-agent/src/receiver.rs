//! Contract surface between the HTTP transport and the core.
//!
//! The transport itself (framing, decoding, endpoints) lives outside this
//! crate. What it shares with the core is here: the bounded ingest channels,
//! the reject counters it maps into response headers, and the registry of
//! tracer languages reported in payload extras.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::model::Trace;

/// Header the reported-languages extra is published under.
pub const LANGUAGE_HEADER_KEY: &str = "X-Datadog-Reported-Languages";

/// Counters of traffic the core refused, exported by the transport.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    /// Traces dropped for staleness or structural reasons.
    pub traces_dropped: AtomicU64,
    /// Spans inside dropped traces.
    pub spans_dropped: AtomicU64,
    /// Traces rejected by the filter chain.
    pub traces_filtered: AtomicU64,
    /// Spans inside filtered traces.
    pub spans_filtered: AtomicU64,
    /// Fan-out tasks that panicked; the trace is lost.
    pub fanout_panics: AtomicU64,
}

impl ReceiverStats {
    pub fn record_dropped(&self, spans: u64) {
        self.traces_dropped.fetch_add(1, Ordering::Relaxed);
        self.spans_dropped.fetch_add(spans, Ordering::Relaxed);
    }

    pub fn record_filtered(&self, spans: u64) {
        self.traces_filtered.fetch_add(1, Ordering::Relaxed);
        self.spans_filtered.fetch_add(spans, Ordering::Relaxed);
    }

    pub fn record_fanout_panic(&self) {
        self.fanout_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn traces_dropped(&self) -> u64 {
        self.traces_dropped.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn traces_filtered(&self) -> u64 {
        self.traces_filtered.load(Ordering::Relaxed)
    }
}

/// Tracer languages observed by the transport, reported upstream with each
/// payload so the intake knows which clients feed this agent.
#[derive(Debug, Default)]
pub struct LanguageRegistry {
    languages: RwLock<BTreeSet<String>>,
}

impl LanguageRegistry {
    /// Records one client language, as read from request headers.
    pub fn observe(&self, language: &str) {
        if language.is_empty() {
            return;
        }
        let known = self
            .languages
            .read()
            .expect("language registry lock poisoned")
            .contains(language);
        if !known {
            self.languages
                .write()
                .expect("language registry lock poisoned")
                .insert(language.to_string());
        }
    }

    /// Pipe-separated sorted list, the wire format of the language header.
    pub fn languages(&self) -> String {
        self.languages
            .read()
            .expect("language registry lock poisoned")
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Bounded channel pair carrying decoded traces from the transport into the
/// dispatcher. The transport uses `try_send` and answers 429 when full; the
/// core never blocks it.
pub fn trace_channel(capacity: usize) -> (mpsc::Sender<Trace>, mpsc::Receiver<Trace>) {
    mpsc::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ReceiverStats::default();
        stats.record_dropped(3);
        stats.record_dropped(2);
        stats.record_filtered(7);
        assert_eq!(stats.traces_dropped(), 2);
        assert_eq!(stats.spans_dropped(), 5);
        assert_eq!(stats.traces_filtered(), 1);
    }

    #[test]
    fn test_language_registry_dedupes_and_sorts() {
        let registry = LanguageRegistry::default();
        registry.observe("python");
        registry.observe("go");
        registry.observe("python");
        registry.observe("");
        assert_eq!(registry.languages(), "go|python");
    }

    #[tokio::test]
    async fn test_trace_channel_bounded() {
        let (tx, mut rx) = trace_channel(1);
        tx.try_send(Vec::new()).unwrap();
        // Second send must fail instead of blocking the transport.
        assert!(tx.try_send(Vec::new()).is_err());
        rx.recv().await.unwrap();
        assert!(tx.try_send(Vec::new()).is_ok());
    }
}
