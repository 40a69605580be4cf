//! Sampling rates keyed by (service, env).
//!
//! The priority sampler publishes a rate per service here; the transport
//! snapshots the table into its HTTP responses so client-side sampling can
//! converge on it. Reads vastly outnumber writes, so the table sits behind a
//! read/write lock, and entries untouched for longer than the TTL are
//! evicted lazily on the next access.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default rate reported for services the sampler has not seen yet.
const DEFAULT_RATE: f64 = 1.0;

#[derive(Clone, Debug)]
struct RateEntry {
    rate: f64,
    last_update: Instant,
}

/// Concurrent (service, env) → sampling-rate table with TTL eviction.
pub struct RateByService {
    ttl: Duration,
    rates: RwLock<HashMap<(String, String), RateEntry>>,
}

impl RateByService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            rates: RwLock::new(HashMap::new()),
        }
    }

    /// Rate for a service, 1.0 when unknown. Expired entries are evicted on
    /// the way out.
    pub fn get_rate(&self, service: &str, env: &str) -> f64 {
        let key = (service.to_string(), env.to_string());
        let expired = {
            let rates = self.rates.read().expect("rates lock poisoned");
            match rates.get(&key) {
                Some(entry) if entry.last_update.elapsed() <= self.ttl => return entry.rate,
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            let mut rates = self.rates.write().expect("rates lock poisoned");
            if rates
                .get(&key)
                .is_some_and(|e| e.last_update.elapsed() > self.ttl)
            {
                rates.remove(&key);
            }
        }
        DEFAULT_RATE
    }

    /// Stores a rate, clamped to [0, 1], and refreshes its TTL. Expired
    /// entries are swept while the write lock is held.
    pub fn set_rate(&self, service: &str, env: &str, rate: f64) {
        let mut rates = self.rates.write().expect("rates lock poisoned");
        rates.retain(|_, entry| entry.last_update.elapsed() <= self.ttl);
        rates.insert(
            (service.to_string(), env.to_string()),
            RateEntry {
                rate: rate.clamp(0.0, 1.0),
                last_update: Instant::now(),
            },
        );
    }

    /// Snapshot of all live rates in the wire key format
    /// `service:<service>,env:<env>`, ready to embed in an HTTP response.
    pub fn get_all(&self) -> HashMap<String, f64> {
        let rates = self.rates.read().expect("rates lock poisoned");
        rates
            .iter()
            .filter(|(_, entry)| entry.last_update.elapsed() <= self.ttl)
            .map(|((service, env), entry)| {
                (format!("service:{service},env:{env}"), entry.rate)
            })
            .collect()
    }

    #[cfg(test)]
    fn force_age(&self, service: &str, env: &str, age: Duration) {
        let mut rates = self.rates.write().expect("rates lock poisoned");
        if let Some(entry) = rates.get_mut(&(service.to_string(), env.to_string())) {
            entry.last_update = Instant::now() - age;
        }
    }
}
