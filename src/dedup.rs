//! Request deduplication and coalescing.
//!
//! Identical non-streaming requests arriving while one is still in flight
//! attach to the outstanding call instead of dispatching their own; after a
//! success, the response is served from cache for a short TTL. The
//! fingerprint is a SHA-256 over the canonicalized request fields, so JSON
//! field order never affects identity.
//!
//! State machine per fingerprint: vacant → in-flight → (completed | vacant).
//! Only 2xx outcomes reach the completed state; errors are shared with the
//! waiters of that flight and then forgotten.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Terminal result of one coalesced flight, mirrored to every waiter.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub status: u16,
    pub body: Value,
    /// Model that produced the response, when one succeeded.
    pub model: Option<String>,
}

impl DedupOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

enum Entry {
    InFlight(watch::Receiver<Option<DedupOutcome>>),
    Completed {
        outcome: DedupOutcome,
        inserted_at: Instant,
    },
}

/// What a caller holds after asking the cache about a fingerprint.
pub enum Claim {
    /// Cached response; serve verbatim.
    Hit(DedupOutcome),
    /// This caller owns the upstream flight and must publish its outcome.
    Leader(FlightGuard),
    /// Another flight is outstanding; await its outcome.
    Follower(watch::Receiver<Option<DedupOutcome>>),
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    max_entries: usize,
}

/// Coalescing response cache, keyed by request fingerprint.
#[derive(Clone)]
pub struct DedupCache {
    inner: Arc<Inner>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl,
                max_entries: DEFAULT_MAX_ENTRIES,
            }),
        }
    }

    /// Claim a fingerprint: returns a cache hit, leadership of a new flight,
    /// or a follower handle onto the outstanding one.
    pub fn claim(&self, fingerprint: &str) -> Claim {
        let mut entries = self.inner.entries.lock().expect("dedup lock");

        let stale = match entries.get(fingerprint) {
            Some(Entry::Completed {
                outcome,
                inserted_at,
            }) => {
                if inserted_at.elapsed() < self.inner.ttl {
                    return Claim::Hit(outcome.clone());
                }
                true
            }
            Some(Entry::InFlight(rx)) => {
                return Claim::Follower(rx.clone());
            }
            None => false,
        };
        if stale {
            entries.remove(fingerprint);
        }

        if entries.len() >= self.inner.max_entries {
            evict_one(&mut entries);
        }

        let (tx, rx) = watch::channel(None);
        entries.insert(fingerprint.to_string(), Entry::InFlight(rx));
        Claim::Leader(FlightGuard {
            cache: Arc::clone(&self.inner),
            fingerprint: fingerprint.to_string(),
            tx: Some(tx),
        })
    }

    /// Wait on another caller's flight. Errors if the leader was cancelled
    /// before publishing, in which case the caller should report a transport
    /// error rather than retry (the client can resubmit).
    pub async fn await_follower(
        mut rx: watch::Receiver<Option<DedupOutcome>>,
    ) -> Result<DedupOutcome, FlightCancelled> {
        let result = rx.wait_for(|v| v.is_some()).await;
        match result {
            Ok(guard) => Ok(guard.clone().expect("checked is_some")),
            Err(_) => Err(FlightCancelled),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("dedup lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The originating request of a coalesced flight disconnected before the
/// upstream answered.
#[derive(Debug)]
pub struct FlightCancelled;

/// Held by the flight leader. Publishing a success commits the response to
/// the cache; publishing an error shares it with current waiters only.
/// Dropping without publishing (client disconnect) wakes waiters with
/// `FlightCancelled` and leaves nothing cached.
pub struct FlightGuard {
    cache: Arc<Inner>,
    fingerprint: String,
    tx: Option<watch::Sender<Option<DedupOutcome>>>,
}

impl FlightGuard {
    /// Publish the flight's terminal outcome to all waiters.
    pub fn complete(mut self, outcome: DedupOutcome) {
        let tx = self.tx.take().expect("complete called once");
        let mut entries = self.cache.entries.lock().expect("dedup lock");
        if outcome.is_success() {
            entries.insert(
                self.fingerprint.clone(),
                Entry::Completed {
                    outcome: outcome.clone(),
                    inserted_at: Instant::now(),
                },
            );
        } else {
            entries.remove(&self.fingerprint);
        }
        drop(entries);
        // Waiters hold their own receiver clones; send_replace works even
        // after the map entry is gone.
        tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // Leader cancelled mid-flight: clear the entry so the next
            // arrival starts fresh; dropping tx wakes followers with an error.
            let mut entries = self.cache.entries.lock().expect("dedup lock");
            if matches!(entries.get(&self.fingerprint), Some(Entry::InFlight(_))) {
                entries.remove(&self.fingerprint);
            }
        }
    }
}

fn evict_one(entries: &mut HashMap<String, Entry>) {
    // Prefer the oldest completed entry; never evict an in-flight cell.
    let oldest = entries
        .iter()
        .filter_map(|(key, entry)| match entry {
            Entry::Completed { inserted_at, .. } => Some((key.clone(), *inserted_at)),
            Entry::InFlight(_) => None,
        })
        .min_by_key(|(_, at)| *at)
        .map(|(key, _)| key);
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}

/// Fingerprint of the canonicalized request.
///
/// serde_json maps are BTree-backed, so serializing the rebuilt object (and
/// any nested objects inside `messages`) yields sorted keys without extra
/// work; the incoming field order is already gone by the time we hash.
pub fn fingerprint(
    normalized_model: &str,
    messages: &[Value],
    max_tokens: Option<u64>,
    temperature: Option<f64>,
    seed: Option<i64>,
) -> String {
    let canonical = json!({
        "model": normalized_model,
        "messages": messages,
        "max_tokens": max_tokens,
        "temperature": temperature,
        "seed": seed,
    });
    let serialized = serde_json::to_string(&canonical).expect("canonical json serializes");
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
