//! Live, cached view of one entity collection for an owner and partition.
//!
//! A view never owns cache entries. It reads and refreshes the shared entry
//! for its key through the [`FetchCoordinator`], publishes what it knows on a
//! `watch` channel, and keeps one change-feed subscription open while
//! mounted. Results that arrive after an unmount or a scope change are
//! dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::error::MutationError;
use crate::application::repos::{
    BackendPorts, Filter, OWNER_COLUMN, PARTITION_COLUMN, QueryRepo, SelectQuery,
};
use crate::cache::lock::mutex_lock;
use crate::cache::{
    BridgeHandle, CONNECT_WAIT, CacheKey, ChangeFilter, CollectionScope, Connecting,
    ExpiryCheck, FetchCoordinator, FetchError, InvalidateFn, InvalidateScope, InvalidationBridge,
    LoadObserver, LoadOptions,
};
use crate::domain::entities::{Draft, Record};
use crate::domain::error::DomainError;
use crate::domain::types::{BusinessType, EntityType};

const SOURCE: &str = "application::collection";

/// Where a view is in its load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing loaded yet.
    Empty,
    /// First visible load in progress.
    Loading,
    Ready,
    /// Data shown is known to be outdated; a refresh follows.
    Stale,
    Refreshing,
    /// The last load failed. Any earlier data is still in `data`.
    Error,
}

#[derive(Debug, Clone)]
pub struct CollectionState<R> {
    pub scope: CollectionScope,
    pub data: Arc<Vec<R>>,
    pub loading: bool,
    pub error: Option<FetchError>,
    pub phase: Phase,
}

impl<R> CollectionState<R> {
    fn empty(scope: CollectionScope) -> Self {
        Self {
            scope,
            data: Arc::new(Vec::new()),
            loading: false,
            error: None,
            phase: Phase::Empty,
        }
    }
}

/// Settings shared by every view built from one hub.
#[derive(Clone)]
pub(crate) struct ViewContext {
    pub coordinator: Arc<FetchCoordinator>,
    pub ports: BackendPorts,
    pub ttl: Duration,
    pub fresh_read: Duration,
    pub reconnect_interval: Duration,
}

pub struct CollectionView<R: Record> {
    inner: Arc<ViewInner<R>>,
}

struct ViewInner<R: Record> {
    context: ViewContext,
    state: watch::Sender<CollectionState<R>>,
    scope: Mutex<CollectionScope>,
    epoch: AtomicU64,
    mounted: AtomicBool,
    bridge: Mutex<Option<BridgeHandle>>,
}

impl<R: Record> fmt::Debug for CollectionView<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionView")
            .field("entity", &R::ENTITY)
            .field("scope", &self.scope())
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

impl<R: Record> CollectionView<R> {
    pub(crate) fn new(context: ViewContext, scope: CollectionScope) -> Self {
        let scope = scope.for_entity(R::ENTITY);
        let (state, _) = watch::channel(CollectionState::empty(scope));
        Self {
            inner: Arc::new(ViewInner {
                context,
                state,
                scope: Mutex::new(scope),
                epoch: AtomicU64::new(0),
                mounted: AtomicBool::new(false),
                bridge: Mutex::new(None),
            }),
        }
    }

    pub fn entity(&self) -> EntityType {
        R::ENTITY
    }

    pub fn scope(&self) -> CollectionScope {
        self.inner.current().0
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::collection(R::ENTITY, self.scope())
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        mutex_lock(&self.inner.bridge, SOURCE, "is_subscribed").is_some()
    }

    /// Current best-known snapshot; empty before the first load.
    pub fn data(&self) -> Arc<Vec<R>> {
        Arc::clone(&self.inner.state.borrow().data)
    }

    pub fn loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn error(&self) -> Option<FetchError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.borrow().phase
    }

    pub fn state(&self) -> CollectionState<R> {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<CollectionState<R>> {
        self.inner.state.subscribe()
    }

    /// Wait until the view is in `phase`.
    pub async fn wait_for_phase(&self, phase: Phase) -> CollectionState<R> {
        let mut receiver = self.subscribe();
        match receiver.wait_for(|state| state.phase == phase).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Open the change-feed subscription and read the collection. The read
    /// waits (briefly) for the subscription, so a change made right after it
    /// is never missed.
    ///
    /// A snapshot younger than the fresh-read window is served as is. An
    /// older live snapshot is shown right away and refreshed silently.
    /// Otherwise the collection is loaded with a loading signal.
    pub async fn mount(&self) -> Result<Arc<Vec<R>>, FetchError> {
        self.inner.mounted.store(true, Ordering::SeqCst);
        let (scope, epoch) = self.inner.current();
        self.inner.open_bridge(scope, epoch).wait(CONNECT_WAIT).await;
        self.inner.initial_read(scope, epoch).await
    }

    /// Close the subscription and stop applying results. Idempotent.
    pub fn unmount(&self) {
        if !self.inner.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.close_bridge();
        debug!(entity = %R::ENTITY, "Collection view unmounted");
    }

    /// Switch to another owner or partition. The old subscription is closed
    /// before the new one opens.
    pub async fn set_scope(
        &self,
        owner: Uuid,
        partition: Option<BusinessType>,
    ) -> Result<Arc<Vec<R>>, FetchError> {
        let scope = CollectionScope::new(owner, partition).for_entity(R::ENTITY);
        let epoch = {
            let mut current = mutex_lock(&self.inner.scope, SOURCE, "set_scope");
            if *current == scope {
                drop(current);
                return Ok(self.data());
            }
            *current = scope;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        self.inner.close_bridge();
        self.inner.state.send_replace(CollectionState::empty(scope));
        info!(entity = %R::ENTITY, owner = %owner, partition = ?scope.partition, "Collection scope changed");

        if !self.is_mounted() {
            return Ok(self.data());
        }
        self.inner.open_bridge(scope, epoch).wait(CONNECT_WAIT).await;
        self.inner.initial_read(scope, epoch).await
    }

    /// Reload bypassing cache freshness, with a loading signal. Joins a fetch
    /// that is already running.
    pub async fn refresh(&self) -> Result<Arc<Vec<R>>, FetchError> {
        let (scope, epoch) = self.inner.current();
        self.inner.fetch(scope, epoch, LoadOptions::forced()).await
    }

    /// Drop the cache entry and reload silently.
    pub async fn invalidate_and_refresh(&self) -> Result<Arc<Vec<R>>, FetchError> {
        self.inner.invalidate_and_refresh().await
    }

    pub async fn create(&self, draft: R::Draft) -> Result<R, MutationError> {
        self.create_with(draft, Map::new()).await
    }

    /// Insert `draft` with extra backend columns merged in.
    pub(crate) async fn create_with(
        &self,
        draft: R::Draft,
        extra: Map<String, Value>,
    ) -> Result<R, MutationError> {
        draft.validate()?;
        let scope = self.scope();
        let table = R::ENTITY.table();
        let record = insert_row::<R>(&draft, scope, extra)?;

        let row = self
            .inner
            .context
            .ports
            .mutation
            .insert(table, record)
            .await
            .map_err(|err| {
                warn!(table, error = %err, "Insert failed; cache left untouched");
                MutationError::backend(table, "insert", &err)
            })?;
        let created: R = serde_json::from_value(row).map_err(|err| MutationError::decode(table, err))?;
        info!(table, id = %created.id(), "Record created");

        self.refresh_after_mutation().await;
        Ok(created)
    }

    /// Apply a partial patch. Only fields set in `patch` change.
    pub async fn update(&self, id: Uuid, patch: R::Patch) -> Result<R, MutationError> {
        let scope = self.scope();
        let table = R::ENTITY.table();
        let patch = serde_json::to_value(&patch).map_err(|err| MutationError::decode(table, err))?;

        let row = self
            .inner
            .context
            .ports
            .mutation
            .update(table, scope.owner, id, patch)
            .await
            .map_err(|err| {
                warn!(table, id = %id, error = %err, "Update failed; cache left untouched");
                MutationError::backend(table, "update", &err)
            })?;
        let updated: R = serde_json::from_value(row).map_err(|err| MutationError::decode(table, err))?;
        info!(table, id = %id, "Record updated");

        self.refresh_after_mutation().await;
        Ok(updated)
    }

    /// Delete after backend confirmation; the row is never removed locally
    /// first.
    pub async fn delete(&self, id: Uuid) -> Result<(), MutationError> {
        let scope = self.scope();
        let table = R::ENTITY.table();

        self.inner
            .context
            .ports
            .mutation
            .delete(table, scope.owner, id)
            .await
            .map_err(|err| {
                warn!(table, id = %id, error = %err, "Delete failed; cache left untouched");
                MutationError::backend(table, "delete", &err)
            })?;
        info!(table, id = %id, "Record deleted");

        self.refresh_after_mutation().await;
        Ok(())
    }

    async fn refresh_after_mutation(&self) {
        // The write itself succeeded; a failed reload is reported through
        // the view state instead of failing the mutation.
        if let Err(err) = self.inner.invalidate_and_refresh().await {
            debug!(entity = %R::ENTITY, error = %err, "Reload after mutation failed");
        }
    }
}

impl<R: Record> Drop for CollectionView<R> {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl<R: Record> ViewInner<R> {
    fn current(&self) -> (CollectionScope, u64) {
        let scope = mutex_lock(&self.scope, SOURCE, "current");
        (*scope, self.epoch.load(Ordering::SeqCst))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.mounted.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Apply `update` unless the view moved on since `epoch`.
    fn update_state(&self, epoch: u64, update: impl FnOnce(&mut CollectionState<R>)) -> bool {
        if !self.is_current(epoch) {
            debug!(entity = %R::ENTITY, epoch, "Dropping result for unmounted or rescoped view");
            return false;
        }
        self.state.send_modify(update);
        true
    }

    /// Callback for the bridge opened at `epoch`. It does nothing once the
    /// view has been unmounted or rescoped since.
    fn realtime_callback(self: &Arc<Self>, epoch: u64) -> InvalidateFn {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            let Some(view) = weak.upgrade() else {
                return;
            };
            if !view.is_current(epoch) {
                debug!(
                    entity = %R::ENTITY,
                    epoch,
                    "Ignoring invalidation from a closed subscription"
                );
                return;
            }
            tokio::spawn(async move {
                if !view.is_current(epoch) {
                    return;
                }
                if let Err(err) = view.invalidate_and_refresh().await {
                    debug!(entity = %R::ENTITY, error = %err, "Realtime refresh failed");
                }
            });
        })
    }

    /// True when the snapshot shown at `epoch` has expired and no fetch for
    /// it is running.
    fn expiry_check(self: &Arc<Self>, scope: CollectionScope, epoch: u64) -> ExpiryCheck {
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = CacheKey::collection(R::ENTITY, scope);
        Arc::new(move || {
            let Some(view) = weak.upgrade() else {
                return false;
            };
            if !view.is_current(epoch) {
                return false;
            }
            let settled = !matches!(view.state.borrow().phase, Phase::Empty | Phase::Loading);
            let coordinator = &view.context.coordinator;
            settled && !coordinator.is_in_flight(&key) && !coordinator.store().is_live(&key)
        })
    }

    fn open_bridge(self: &Arc<Self>, scope: CollectionScope, epoch: u64) -> Connecting {
        let handle = InvalidationBridge::open_with_fallback(
            Arc::clone(&self.context.ports.feed),
            ChangeFilter::new(R::ENTITY, scope.owner, scope.partition),
            self.context.reconnect_interval,
            self.realtime_callback(epoch),
            self.expiry_check(scope, epoch),
        );
        let connecting = handle.connecting();
        let previous = mutex_lock(&self.bridge, SOURCE, "open_bridge").replace(handle);
        if let Some(previous) = previous {
            previous.close();
        }
        connecting
    }

    fn close_bridge(&self) {
        let handle = mutex_lock(&self.bridge, SOURCE, "close_bridge").take();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    async fn initial_read(
        self: &Arc<Self>,
        scope: CollectionScope,
        epoch: u64,
    ) -> Result<Arc<Vec<R>>, FetchError> {
        let coordinator = &self.context.coordinator;
        if coordinator.reads_cache() {
            let key = CacheKey::collection(R::ENTITY, scope);
            let store = coordinator.store();
            let fresh = store.is_fresh(&key, self.context.fresh_read);
            if let Some(data) = store.get::<Vec<R>>(&key) {
                if fresh {
                    self.apply(epoch, &Ok(Arc::clone(&data)));
                    return Ok(data);
                }
                self.update_state(epoch, |state| {
                    state.data = data;
                    state.phase = Phase::Stale;
                });
                return self.fetch(scope, epoch, LoadOptions::forced().silent()).await;
            }
        }
        self.fetch(scope, epoch, LoadOptions::cached()).await
    }

    async fn invalidate_and_refresh(self: &Arc<Self>) -> Result<Arc<Vec<R>>, FetchError> {
        let (scope, epoch) = self.current();
        let key = CacheKey::collection(R::ENTITY, scope);
        self.context
            .coordinator
            .invalidate(&InvalidateScope::Key(key));
        self.update_state(epoch, |state| {
            if state.phase != Phase::Empty {
                state.phase = Phase::Stale;
            }
        });
        self.fetch(scope, epoch, LoadOptions::forced().silent()).await
    }

    async fn fetch(
        self: &Arc<Self>,
        scope: CollectionScope,
        epoch: u64,
        options: LoadOptions<'_>,
    ) -> Result<Arc<Vec<R>>, FetchError> {
        if options.silent {
            self.update_state(epoch, |state| state.phase = Phase::Refreshing);
        }

        let signal = LoadingSignal { view: self, epoch };
        let options = options.observed_by(&signal);
        let key = CacheKey::collection(R::ENTITY, scope);
        let query = Arc::clone(&self.context.ports.query);

        let result = self
            .context
            .coordinator
            .load(&key, self.context.ttl, options, move || {
                fetch_collection::<R>(Arc::clone(&query), scope)
            })
            .await;

        self.apply(epoch, &result);
        result
    }

    fn apply(&self, epoch: u64, result: &Result<Arc<Vec<R>>, FetchError>) {
        self.update_state(epoch, |state| match result {
            Ok(data) => {
                state.data = Arc::clone(data);
                state.error = None;
                state.phase = Phase::Ready;
            }
            Err(err) => {
                state.error = Some(err.clone());
                state.phase = Phase::Error;
            }
        });
    }
}

struct LoadingSignal<'a, R: Record> {
    view: &'a ViewInner<R>,
    epoch: u64,
}

impl<R: Record> LoadObserver for LoadingSignal<'_, R> {
    fn loading(&self, active: bool) {
        self.view.update_state(self.epoch, |state| {
            state.loading = active;
            if active {
                state.phase = if state.data.is_empty() {
                    Phase::Loading
                } else {
                    Phase::Refreshing
                };
            }
        });
    }
}

/// Owner- and partition-scoped select for a whole collection.
pub(crate) fn collection_query(entity: EntityType, scope: CollectionScope) -> SelectQuery {
    let scope = scope.for_entity(entity);
    let query = SelectQuery::new(entity.table(), scope.owner);
    match scope.partition {
        Some(partition) => query.filter(Filter::eq(PARTITION_COLUMN, partition)),
        None => query,
    }
}

async fn fetch_collection<R: Record>(
    query: Arc<dyn QueryRepo>,
    scope: CollectionScope,
) -> Result<Vec<R>, FetchError> {
    let table = R::ENTITY.table();
    let select = collection_query(R::ENTITY, scope).order(R::order_by());
    let rows = query
        .select(&select)
        .await
        .map_err(|err| FetchError::backend(table, &err))?;
    decode_rows(table, rows)
}

pub(crate) fn decode_rows<R: Record>(table: &str, rows: Vec<Value>) -> Result<Vec<R>, FetchError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|err| FetchError::decode(table, err)))
        .collect()
}

fn insert_row<R: Record>(
    draft: &R::Draft,
    scope: CollectionScope,
    extra: Map<String, Value>,
) -> Result<Value, MutationError> {
    let table = R::ENTITY.table();
    let mut row = match serde_json::to_value(draft).map_err(|err| MutationError::decode(table, err))? {
        Value::Object(map) => map,
        other => {
            return Err(MutationError::decode(
                table,
                format!("draft must serialize to an object, got `{other}`"),
            ));
        }
    };

    row.insert(OWNER_COLUMN.to_string(), Value::String(scope.owner.to_string()));
    if R::ENTITY.is_partitioned() {
        let partition = scope.partition.ok_or_else(|| {
            DomainError::validation(format!(
                "a business type is required to create {}",
                R::ENTITY
            ))
        })?;
        row.insert(
            PARTITION_COLUMN.to_string(),
            Value::String(partition.as_str().to_string()),
        );
    }
    row.extend(extra);
    Ok(Value::Object(row))
}
