//! Trace filters applied to the root span before sampling.
//!
//! Filters run in order; the first one that refuses the root rejects the
//! whole trace. The built-in filter is a resource blacklist: case-sensitive
//! regexes compiled once at construction, rejecting on match.

use regex::Regex;
use tracing::warn;

use crate::config::Config;
use crate::model::Span;

/// A predicate over the root span of a trace.
pub trait Filter: Send + Sync {
    /// Returns `false` to reject the trace.
    fn keep(&self, root: &Span) -> bool;
}

/// Rejects traces whose root resource matches any blacklisted pattern.
pub struct ResourceFilter {
    blacklist: Vec<Regex>,
}

impl ResourceFilter {
    /// Compiles the pattern list. Invalid patterns are skipped with a
    /// warning rather than taking the agent down over one bad config line.
    pub fn new(patterns: &[String]) -> Self {
        let blacklist = patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!("invalid resource filter pattern {pattern:?}: {err}");
                    None
                }
            })
            .collect();
        Self { blacklist }
    }
}

impl Filter for ResourceFilter {
    fn keep(&self, root: &Span) -> bool {
        !self
            .blacklist
            .iter()
            .any(|regex| regex.is_match(&root.resource))
    }
}

/// Builds the configured filter chain.
pub fn setup(config: &Config) -> Vec<Box<dyn Filter>> {
    vec![Box::new(ResourceFilter::new(&config.ignored_resources))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testutil::span_with;

    fn root(resource: &str) -> Span {
        span_with(1, 1, 0, "web", "request", resource)
    }

    #[test]
    fn test_empty_blacklist_keeps_everything() {
        let filter = ResourceFilter::new(&[]);
        assert!(filter.keep(&root("GET /healthcheck")));
    }

    #[test]
    fn test_matching_resource_rejected() {
        let filter = ResourceFilter::new(&["GET /healthcheck".to_string()]);
        assert!(!filter.keep(&root("GET /healthcheck")));
        assert!(filter.keep(&root("GET /checkout")));
    }

    #[test]
    fn test_regex_patterns() {
        let filter = ResourceFilter::new(&["(GET|POST) /(health|ping)".to_string()]);
        assert!(!filter.keep(&root("GET /health")));
        assert!(!filter.keep(&root("POST /ping")));
        assert!(filter.keep(&root("PUT /health"))); // method not listed
    }

    #[test]
    fn test_case_sensitive() {
        let filter = ResourceFilter::new(&["GET /health".to_string()]);
        assert!(filter.keep(&root("get /health")));
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let filter = ResourceFilter::new(&["[unclosed".to_string(), "/ping".to_string()]);
        assert!(!filter.keep(&root("GET /ping")));
        assert!(filter.keep(&root("GET /other")));
    }

    #[test]
    fn test_chain_ordering() {
        struct RejectAll;
        impl Filter for RejectAll {
            fn keep(&self, _root: &Span) -> bool {
                false
            }
        }
        let chain: Vec<Box<dyn Filter>> = vec![
            Box::new(ResourceFilter::new(&[])),
            Box::new(RejectAll),
        ];
        let span = root("r");
        let verdict = chain.iter().all(|f| f.keep(&span));
        assert!(!verdict);
    }
}
