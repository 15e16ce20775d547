//! TTL cache store.
//!
//! One process-wide map from rendered key to an immutable snapshot. Entries
//! are replaced wholesale, never patched. An entry read after
//! `stored_at + ttl` is treated as absent and purged on the spot.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::clock::Clock;
use super::config::CacheConfig;
use super::keys::{CacheKey, InvalidateScope};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "kasirpro_cache_hit_total";
const METRIC_MISS: &str = "kasirpro_cache_miss_total";
const METRIC_EXPIRED: &str = "kasirpro_cache_expired_total";
const METRIC_EVICT: &str = "kasirpro_cache_evict_total";
const METRIC_INVALIDATED: &str = "kasirpro_cache_invalidated_total";

/// Type-erased snapshot shared between every reader of a key.
pub type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct CacheEntry {
    payload: Payload,
    pub stored_at: OffsetDateTime,
    pub ttl: Duration,
}

/// `start + span`, or `None` when that lies past the representable range.
fn deadline(start: OffsetDateTime, span: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(span)
        .ok()
        .and_then(|span| start.checked_add(span))
}

impl CacheEntry {
    /// `None` for a TTL so long the entry never expires.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        deadline(self.stored_at, self.ttl)
    }

    pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_none_or(|expires_at| now <= expires_at)
    }

    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.payload).downcast::<T>().ok()
    }

    /// True when both entries hold the very same snapshot allocation.
    pub fn same_snapshot(&self, other: &CacheEntry) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("stored_at", &self.stored_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

enum Lookup {
    Missing,
    Expired,
    Live(Payload, OffsetDateTime),
}

pub struct TtlStore {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl TtlStore {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.max_entries_non_zero())),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Store `payload` under `key`, replacing any previous entry.
    pub fn set<T: Any + Send + Sync>(&self, key: CacheKey, payload: Arc<T>, ttl: Duration) {
        self.set_erased(key, payload, ttl);
    }

    pub(crate) fn set_erased(&self, key: CacheKey, payload: Payload, ttl: Duration) {
        let entry = CacheEntry {
            payload,
            stored_at: self.clock.now(),
            ttl,
        };
        let evicted = mutex_lock(&self.entries, SOURCE, "set").push(key.clone(), entry);
        // `push` also returns the replaced entry when the key already existed.
        if let Some((evicted_key, _)) = evicted.filter(|(evicted_key, _)| *evicted_key != key) {
            counter!(METRIC_EVICT).increment(1);
            debug!(key = %evicted_key, "Cache entry evicted for capacity");
        }
    }

    /// Fresh payload for `key`, or `None` if absent, expired or of another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &CacheKey) -> Option<Arc<T>> {
        let payload = self.get_erased(key)?;
        match payload.downcast::<T>() {
            Ok(snapshot) => Some(snapshot),
            Err(_) => {
                warn!(key = %key, "Cached payload has an unexpected type; treating as miss");
                None
            }
        }
    }

    pub(crate) fn get_erased(&self, key: &CacheKey) -> Option<Payload> {
        match self.lookup(key, "get") {
            Lookup::Live(payload, _) => {
                counter!(METRIC_HIT).increment(1);
                debug!(key = %key, "Cache hit");
                Some(payload)
            }
            Lookup::Expired | Lookup::Missing => {
                counter!(METRIC_MISS).increment(1);
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// Stricter than expiry: the entry must also be younger than `max_age`.
    pub fn is_fresh(&self, key: &CacheKey, max_age: Duration) -> bool {
        match self.lookup(key, "is_fresh") {
            Lookup::Live(_, stored_at) => {
                deadline(stored_at, max_age).is_none_or(|until| self.clock.now() <= until)
            }
            Lookup::Expired | Lookup::Missing => false,
        }
    }

    fn lookup(&self, key: &CacheKey, op: &'static str) -> Lookup {
        let now = self.clock.now();
        let mut entries = mutex_lock(&self.entries, SOURCE, op);
        let live = match entries.peek(key) {
            Some(entry) => entry.is_live_at(now),
            None => return Lookup::Missing,
        };
        if !live {
            entries.pop(key);
            counter!(METRIC_EXPIRED).increment(1);
            debug!(key = %key, "Purged expired cache entry");
            return Lookup::Expired;
        }
        match entries.get(key) {
            Some(entry) => Lookup::Live(Arc::clone(&entry.payload), entry.stored_at),
            None => Lookup::Missing,
        }
    }

    /// Inspect an entry without promoting, purging or counting it.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        mutex_lock(&self.entries, SOURCE, "entry").peek(key).cloned()
    }

    /// Whether `key` holds an unexpired entry. Like `entry`, this neither
    /// promotes nor purges nor counts.
    pub fn is_live(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        mutex_lock(&self.entries, SOURCE, "is_live")
            .peek(key)
            .is_some_and(|entry| entry.is_live_at(now))
    }

    /// Remove every entry matched by `scope`. Returns how many were removed.
    pub fn invalidate(&self, scope: &InvalidateScope) -> usize {
        let removed = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate");
            match scope {
                InvalidateScope::Key(key) => usize::from(entries.pop(key).is_some()),
                InvalidateScope::All => {
                    let count = entries.len();
                    entries.clear();
                    count
                }
                InvalidateScope::Prefix(_) | InvalidateScope::Contains(_) => {
                    let doomed: Vec<CacheKey> = entries
                        .iter()
                        .filter(|(key, _)| scope.matches(key))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in &doomed {
                        entries.pop(key);
                    }
                    doomed.len()
                }
            }
        };

        counter!(METRIC_INVALIDATED).increment(removed as u64);
        debug!(scope = ?scope, removed, "Cache entries invalidated");
        removed
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
