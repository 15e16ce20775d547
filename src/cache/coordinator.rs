//! Single-flight loader in front of the TTL store.
//!
//! A load for a key joins whatever fetch is already running for it, serves a
//! live cache entry when not forced, or starts one fetch on a spawned task.
//! The marker is checked and inserted in one synchronous `DashMap` entry
//! operation, so two callers can never both start a fetch for the same key.
//!
//! `invalidate` flags every running fetch it covers as superseded, and a
//! superseded fetch never writes its result. Callers that joined one wait for
//! it to finish, then go around again and start (or join) one fetch begun
//! after the invalidation. At most one fetch per key is outstanding at any
//! time. Nothing is tracked for a key once its fetch has finished, so the
//! bookkeeping stays bounded by the number of running fetches.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::error::FetchError;
use super::keys::{CacheKey, InvalidateScope};
use super::store::{Payload, TtlStore};

const METRIC_FETCH_STARTED: &str = "kasirpro_fetch_started_total";
const METRIC_FETCH_JOINED: &str = "kasirpro_fetch_joined_total";
const METRIC_FETCH_FAILED: &str = "kasirpro_fetch_failed_total";
const METRIC_FETCH_DISCARDED: &str = "kasirpro_fetch_discarded_total";
const METRIC_FETCH_LATENCY: &str = "kasirpro_fetch_latency_seconds";

/// Upper bound on how often one `load` chases a superseded fetch before it
/// settles for the latest result it has.
const MAX_SUPERSEDED_RETRIES: usize = 3;

/// Result of one backend fetch plus whether an invalidation overtook it.
#[derive(Clone)]
struct Outcome {
    result: Result<Payload, FetchError>,
    superseded: bool,
}

type SharedFetch = Shared<BoxFuture<'static, Outcome>>;

/// Receives loading-state transitions of non-silent loads.
pub trait LoadObserver: Send + Sync {
    fn loading(&self, active: bool);
}

#[derive(Clone, Copy, Default)]
pub struct LoadOptions<'a> {
    /// Skip the cache read and go to the backend (still single-flight).
    pub force: bool,
    /// Do not report loading state.
    pub silent: bool,
    pub observer: Option<&'a dyn LoadObserver>,
}

impl<'a> LoadOptions<'a> {
    pub fn cached() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn observed_by(mut self, observer: &'a dyn LoadObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn signal(&self, active: bool) {
        if self.silent {
            return;
        }
        if let Some(observer) = self.observer {
            observer.loading(active);
        }
    }
}

#[derive(Clone)]
struct InFlight {
    id: u64,
    superseded: bool,
    fetch: SharedFetch,
}

enum Begin {
    Hit(Payload),
    Await(SharedFetch),
}

pub struct FetchCoordinator {
    store: Arc<TtlStore>,
    in_flight: Arc<DashMap<CacheKey, InFlight>>,
    next_id: AtomicU64,
    read_cache: bool,
}

impl FetchCoordinator {
    pub fn new(store: Arc<TtlStore>, read_cache: bool) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            read_cache,
        }
    }

    pub fn store(&self) -> &Arc<TtlStore> {
        &self.store
    }

    /// False when caching is disabled and every load goes to the backend.
    pub fn reads_cache(&self) -> bool {
        self.read_cache
    }

    /// Whether a fetch for `key` is currently running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Load the snapshot for `key`, fetching it with `fetch` if needed.
    ///
    /// On failure the previous store entry is left untouched and the error is
    /// returned to every caller that joined the fetch. Nothing is retried.
    pub async fn load<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        options: LoadOptions<'_>,
        fetch: F,
    ) -> Result<Arc<T>, FetchError>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let payload = self.load_inner(key, ttl, &options, &fetch).await?;
        payload
            .downcast::<T>()
            .map_err(|_| FetchError::TypeMismatch {
                key: key.to_string(),
            })
    }

    async fn load_inner<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        options: &LoadOptions<'_>,
        fetch: &F,
    ) -> Result<Payload, FetchError>
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut attempts = 0;
        let mut signalled = false;
        loop {
            let shared = match self.begin(key, ttl, options.force, fetch) {
                Begin::Hit(payload) => {
                    if signalled {
                        options.signal(false);
                    }
                    return Ok(payload);
                }
                Begin::Await(fetch) => fetch,
            };

            if !signalled {
                options.signal(true);
                signalled = true;
            }
            let outcome = shared.await;
            attempts += 1;
            if !outcome.superseded || attempts > MAX_SUPERSEDED_RETRIES {
                options.signal(false);
                return outcome.result;
            }
            debug!(key = %key, attempts, "Fetch superseded by invalidation; loading again");
        }
    }

    fn begin<T, F, Fut>(&self, key: &CacheKey, ttl: Duration, force: bool, fetch: &F) -> Begin
    where
        T: Any + Send + Sync,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        match self.in_flight.entry(key.clone()) {
            // A superseded fetch is joined too; its outcome says so and the
            // caller goes around once it has finished.
            Entry::Occupied(occupied) => {
                counter!(METRIC_FETCH_JOINED).increment(1);
                let marker = occupied.get();
                debug!(key = %key, stale = marker.superseded, "Joining in-flight fetch");
                Begin::Await(marker.fetch.clone())
            }
            Entry::Vacant(vacant) => {
                if !force && self.read_cache {
                    if let Some(payload) = self.store.get_erased(key) {
                        return Begin::Hit(payload);
                    }
                }

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let shared = self.spawn_fetch(key.clone(), ttl, id, fetch());
                vacant.insert(InFlight {
                    id,
                    superseded: false,
                    fetch: shared.clone(),
                });
                Begin::Await(shared)
            }
        }
    }

    fn spawn_fetch<T, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        id: u64,
        fetch: Fut,
    ) -> SharedFetch
    where
        T: Any + Send + Sync,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        counter!(METRIC_FETCH_STARTED).increment(1);
        debug!(key = %key, id, "Starting fetch");

        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let key = task_key;
            let started = Instant::now();
            let result = fetch.await;
            histogram!(METRIC_FETCH_LATENCY).record(started.elapsed().as_secs_f64());

            // The marker's shard lock is held across check and write, and
            // `invalidate` flags markers under the write side of that lock.
            let marker = in_flight.get(&key);
            let superseded = marker
                .as_deref()
                .is_none_or(|marker| marker.id != id || marker.superseded);
            let result = match result {
                Ok(value) => {
                    let payload: Payload = Arc::new(value);
                    if superseded {
                        counter!(METRIC_FETCH_DISCARDED).increment(1);
                        debug!(key = %key, id, "Discarding result of superseded fetch");
                    } else {
                        store.set_erased(key.clone(), Arc::clone(&payload), ttl);
                    }
                    Ok(payload)
                }
                Err(err) => {
                    counter!(METRIC_FETCH_FAILED).increment(1);
                    warn!(key = %key, error = %err, "Fetch failed; keeping previous entry");
                    Err(err)
                }
            };
            drop(marker);

            in_flight.remove_if(&key, |_, marker| marker.id == id);
            Outcome { result, superseded }
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Outcome {
                    result: Err(FetchError::Aborted {
                        key: key.to_string(),
                        message: join_error.to_string(),
                    }),
                    superseded: false,
                },
            }
        }
        .boxed()
        .shared()
    }

    /// Drop matching entries and mark running fetches for them as superseded.
    pub fn invalidate(&self, scope: &InvalidateScope) -> usize {
        let mut superseded = 0usize;
        match scope {
            InvalidateScope::Key(key) => {
                if let Some(mut marker) = self.in_flight.get_mut(key) {
                    marker.superseded = true;
                    superseded = 1;
                }
            }
            _ => {
                for mut marker in self.in_flight.iter_mut() {
                    if scope.matches(marker.key()) {
                        marker.superseded = true;
                        superseded += 1;
                    }
                }
            }
        }

        let removed = self.store.invalidate(scope);
        info!(scope = ?scope, removed, superseded, "Invalidated cache scope");
        removed
    }
}
