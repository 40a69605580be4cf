//! Outbound payload handed to the uploader.

use std::collections::HashMap;

use crate::model::Trace;
use crate::stats::StatsBucket;

/// One flush worth of data: aggregated statistics plus the sampled traces,
/// under the agent's identity. Extras become HTTP headers upstream and are
/// added through the scoped setter; everything else is fixed at
/// construction.
#[derive(Clone, Debug, Default)]
pub struct Payload {
    pub hostname: String,
    pub env: String,
    pub stats: Vec<StatsBucket>,
    pub traces: Vec<Trace>,
    extras: HashMap<String, String>,
}

impl Payload {
    pub fn new(hostname: String, env: String) -> Self {
        Self {
            hostname,
            env,
            ..Self::default()
        }
    }

    pub fn set_extra(&mut self, key: &str, value: String) {
        self.extras.insert(key.to_string(), value);
    }

    pub fn extras(&self) -> &HashMap<String, String> {
        &self.extras
    }

    /// Whether there is anything worth uploading.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.traces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extras_roundtrip() {
        let mut payload = Payload::new("host".to_string(), "prod".to_string());
        payload.set_extra("X-Reported-Languages", "go|python".to_string());
        assert_eq!(
            payload.extras().get("X-Reported-Languages").map(String::as_str),
            Some("go|python")
        );
    }

    #[test]
    fn test_is_empty() {
        let mut payload = Payload::new("host".to_string(), "prod".to_string());
        assert!(payload.is_empty());
        payload.traces.push(Vec::new());
        assert!(!payload.is_empty());
    }
}
