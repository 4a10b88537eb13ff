//! Per-model dispatch counters backing `/stats`.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct ModelStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    fallbacks_engaged: AtomicU64,
    wrapped_payment_failures: AtomicU64,
}

/// Registry of per-model counters. Cheap to clone handles around via `Arc`.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    models: DashMap<String, ModelStats>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, model: &str) {
        self.bump(model, |s| &s.attempts);
    }

    pub fn record_success(&self, model: &str) {
        self.bump(model, |s| &s.successes);
    }

    /// A recoverable failure on `model` pushed the request to the next
    /// candidate.
    pub fn record_fallback(&self, model: &str) {
        self.bump(model, |s| &s.fallbacks_engaged);
    }

    pub fn record_wrapped_payment_failure(&self, model: &str) {
        self.bump(model, |s| &s.wrapped_payment_failures);
    }

    fn bump(&self, model: &str, field: impl Fn(&ModelStats) -> &AtomicU64) {
        let entry = self.models.entry(model.to_string()).or_default();
        field(entry.value()).fetch_add(1, Ordering::Relaxed);
    }

    /// JSON snapshot for the `/stats` endpoint.
    pub fn snapshot(&self) -> Value {
        let mut models = serde_json::Map::new();
        for entry in self.models.iter() {
            let s = entry.value();
            models.insert(
                entry.key().clone(),
                json!({
                    "attempts": s.attempts.load(Ordering::Relaxed),
                    "successes": s.successes.load(Ordering::Relaxed),
                    "fallbacks_engaged": s.fallbacks_engaged.load(Ordering::Relaxed),
                    "wrapped_payment_failures": s.wrapped_payment_failures.load(Ordering::Relaxed),
                }),
            );
        }
        json!({ "models": models })
    }
}
