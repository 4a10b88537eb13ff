//! Session pin store.
//!
//! Maps `(session_id, tier_profile)` to the last model that answered
//! successfully, so follow-up turns in a conversation keep hitting the same
//! model. Pins are written only after a confirmed 2xx upstream response and
//! are scoped by tier profile: switching from `premium` to `eco` misses by
//! construction.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const DEFAULT_MAX_PINS: usize = 4096;

#[derive(Debug, Clone)]
struct Pin {
    model_id: String,
    expires_at: Instant,
}

/// TTL'd pin store keyed by `(session_id, tier_profile)`.
#[derive(Debug)]
pub struct SessionPinStore {
    pins: DashMap<(String, String), Pin>,
    ttl: Duration,
    max_pins: usize,
}

impl SessionPinStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pins: DashMap::new(),
            ttl,
            max_pins: DEFAULT_MAX_PINS,
        }
    }

    #[cfg(test)]
    fn with_capacity(ttl: Duration, max_pins: usize) -> Self {
        Self {
            pins: DashMap::new(),
            ttl,
            max_pins,
        }
    }

    /// Fetch the pinned model, evicting lazily if the entry expired.
    pub fn get(&self, session_id: &str, tier_profile: &str) -> Option<String> {
        let key = (session_id.to_string(), tier_profile.to_string());
        if let Some(pin) = self.pins.get(&key) {
            if pin.expires_at > Instant::now() {
                return Some(pin.model_id.clone());
            }
        } else {
            return None;
        }
        // Expired: drop the guard before removing.
        self.pins.remove(&key);
        None
    }

    /// Record a successful model for the session. Call only after a 2xx
    /// upstream response.
    pub fn set(&self, session_id: &str, tier_profile: &str, model_id: &str) {
        if self.pins.len() >= self.max_pins {
            self.evict_oldest();
        }
        self.pins.insert(
            (session_id.to_string(), tier_profile.to_string()),
            Pin {
                model_id: model_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .pins
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.pins.remove(&key);
        }
    }
}
