//! Wake request deduplication cache

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::types::{RequestId, WakeOutcome};

/// Default retention for seen request IDs (60 seconds)
pub const DEDUP_TTL_SECS: u64 = 60;

/// Maximum dedup cache entries
const DEDUP_MAX_ENTRIES: usize = 1000;

/// What the cache knows about a request ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    /// First sight; now recorded as in flight
    New,
    /// Already being handled
    InFlight,
    /// Already handled with this outcome
    Completed(WakeOutcome),
}

#[derive(Debug)]
struct Entry {
    first_seen: Instant,
    outcome: Option<WakeOutcome>,
}

/// Wake request deduplication cache
///
/// Keeps a retried request that already woke the device from waking it
/// again. Uses a TTL-based eviction strategy with a hard cap on entries.
#[derive(Debug)]
pub struct RequestDedup {
    cache: HashMap<RequestId, Entry>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for RequestDedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEDUP_TTL_SECS))
    }
}

impl RequestDedup {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: HashMap::new(),
            ttl,
            max_entries: DEDUP_MAX_ENTRIES,
        }
    }

    /// Look up a request ID, recording it as in flight on first sight
    pub fn check(&mut self, id: &RequestId) -> Seen {
        let now = Instant::now();

        if self.cache.len() >= self.max_entries {
            self.cache
                .retain(|_, e| now.duration_since(e.first_seen) < self.ttl);
        }

        if self.cache.len() >= self.max_entries {
            if let Some(oldest) = self
                .cache
                .iter()
                .min_by_key(|(_, e)| e.first_seen)
                .map(|(k, _)| k.clone())
            {
                self.cache.remove(&oldest);
            }
        }

        if let Some(entry) = self.cache.get(id) {
            if now.duration_since(entry.first_seen) < self.ttl {
                return entry.outcome.map_or(Seen::InFlight, Seen::Completed);
            }
        }

        self.cache.insert(
            id.clone(),
            Entry {
                first_seen: now,
                outcome: None,
            },
        );
        Seen::New
    }

    /// Record the outcome of a request previously reported as `New`
    pub fn complete(&mut self, id: &RequestId, outcome: WakeOutcome) {
        if let Some(entry) = self.cache.get_mut(id) {
            entry.outcome = Some(outcome);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
