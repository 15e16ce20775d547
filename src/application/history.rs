//! Paginated order history.
//!
//! Each query runs a count and a ranged select against the backend. The
//! resulting window is cached only briefly, under a key that includes page,
//! page size and filters. A change-feed subscription re-runs the current page
//! whenever the owner's orders change, or once the window expires while the
//! feed is down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::collection::{ViewContext, collection_query, decode_rows};
use crate::application::error::MutationError;
use crate::application::pagination::PageRequest;
use crate::application::repos::{Filter, QueryRepo, SelectQuery};
use crate::cache::lock::mutex_lock;
use crate::cache::{
    BridgeHandle, CONNECT_WAIT, CacheKey, ChangeFilter, CollectionScope, Connecting, ExpiryCheck,
    FetchError, InvalidateFn, InvalidateScope, InvalidationBridge, LoadObserver, LoadOptions,
    hash_value, history_prefix,
};
use crate::domain::entities::{OrderBy, OrderPatch, OrderRecord, Record};
use crate::domain::types::{EntityType, OrderStatus};

const SOURCE: &str = "application::history";
const SEARCH_COLUMN: &str = "customer_name";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HistoryFilters {
    pub status: Option<OrderStatus>,
    /// Substring of the customer name.
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryQuery {
    pub filters: HistoryFilters,
    pub order_by: OrderBy,
    pub page: PageRequest,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            filters: HistoryFilters::default(),
            order_by: OrderRecord::order_by(),
            page: PageRequest::default(),
        }
    }
}

impl HistoryQuery {
    pub fn with_page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }

    fn key(&self, scope: CollectionScope) -> CacheKey {
        CacheKey::page(
            EntityType::Orders,
            scope,
            self.page.page(),
            self.page.page_size(),
            hash_value(&(&self.filters, &self.order_by)),
        )
    }

    fn select(&self, scope: CollectionScope) -> SelectQuery {
        let mut query = collection_query(EntityType::Orders, scope);
        if let Some(status) = self.filters.status {
            query = query.filter(Filter::eq("status", status));
        }
        if let Some(search) = self.filters.search.as_deref().map(str::trim) {
            if !search.is_empty() {
                query = query.filter(Filter::contains(SEARCH_COLUMN, search));
            }
        }
        query
    }
}

/// One page of rows plus the total across all pages.
#[derive(Debug, Clone, PartialEq)]
pub struct PageWindow<R> {
    pub rows: Vec<R>,
    pub total_count: u64,
    pub has_more: bool,
    pub page: PageRequest,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryState {
    pub query: HistoryQuery,
    pub window: Option<Arc<PageWindow<OrderRecord>>>,
    pub loading: bool,
    pub error: Option<FetchError>,
}

pub struct OrderHistory {
    inner: Arc<HistoryInner>,
}

struct HistoryInner {
    context: ViewContext,
    scope: CollectionScope,
    query: Mutex<HistoryQuery>,
    state: watch::Sender<HistoryState>,
    /// Bumped on every unmount so callbacks of a closed subscription can tell.
    epoch: AtomicU64,
    mounted: AtomicBool,
    bridge: Mutex<Option<BridgeHandle>>,
}

impl OrderHistory {
    pub(crate) fn new(context: ViewContext, scope: CollectionScope, query: HistoryQuery) -> Self {
        let (state, _) = watch::channel(HistoryState {
            query: query.clone(),
            ..HistoryState::default()
        });
        Self {
            inner: Arc::new(HistoryInner {
                context,
                scope: scope.for_entity(EntityType::Orders),
                query: Mutex::new(query),
                state,
                epoch: AtomicU64::new(0),
                mounted: AtomicBool::new(false),
                bridge: Mutex::new(None),
            }),
        }
    }

    pub fn scope(&self) -> CollectionScope {
        self.inner.scope
    }

    pub fn current_query(&self) -> HistoryQuery {
        mutex_lock(&self.inner.query, SOURCE, "current_query").clone()
    }

    pub fn window(&self) -> Option<Arc<PageWindow<OrderRecord>>> {
        self.inner.state.borrow().window.clone()
    }

    pub fn state(&self) -> HistoryState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HistoryState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to order changes and run the current query once the
    /// subscription is in place.
    pub async fn mount(&self) -> Result<Arc<PageWindow<OrderRecord>>, FetchError> {
        self.inner.mounted.store(true, Ordering::SeqCst);
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.open_bridge(epoch).wait(CONNECT_WAIT).await;
        let query = self.current_query();
        self.inner.run(query, LoadOptions::cached()).await
    }

    pub fn unmount(&self) {
        if !self.inner.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.state.send_modify(|state| state.loading = false);
        let handle = mutex_lock(&self.inner.bridge, SOURCE, "unmount").take();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Run `query` and make it the current one.
    pub async fn query(
        &self,
        query: HistoryQuery,
    ) -> Result<Arc<PageWindow<OrderRecord>>, FetchError> {
        *mutex_lock(&self.inner.query, SOURCE, "query") = query.clone();
        self.inner.state.send_modify(|state| state.query = query.clone());
        self.inner.run(query, LoadOptions::cached()).await
    }

    /// Jump to a one-based page keeping filters and page size.
    pub async fn go_to_page(&self, page: u32) -> Result<Arc<PageWindow<OrderRecord>>, FetchError> {
        let current = self.current_query();
        let request = PageRequest::new(page, current.page.page_size())
            .map_err(|err| FetchError::InvalidPage(err.to_string()))?;
        self.query(current.with_page(request)).await
    }

    /// Re-run the current page against the backend, bypassing the cache.
    pub async fn refresh(&self) -> Result<Arc<PageWindow<OrderRecord>>, FetchError> {
        let query = self.current_query();
        self.inner.run(query, LoadOptions::forced()).await
    }

    /// Change an order's status, then drop every cached window and the orders
    /// collection for this scope and re-run the current page silently.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: OrderStatus,
    ) -> Result<OrderRecord, MutationError> {
        let table = EntityType::Orders.table();
        let patch = serde_json::to_value(OrderPatch::status(status))
            .map_err(|err| MutationError::decode(table, err))?;

        let row = self
            .inner
            .context
            .ports
            .mutation
            .update(table, self.inner.scope.owner, id, patch)
            .await
            .map_err(|err| {
                warn!(table, id = %id, error = %err, "Status update failed; history left untouched");
                MutationError::backend(table, "update", &err)
            })?;
        let updated: OrderRecord =
            serde_json::from_value(row).map_err(|err| MutationError::decode(table, err))?;
        info!(id = %id, status = %status, "Order status updated");

        self.inner.context.coordinator.invalidate(&InvalidateScope::Key(
            CacheKey::collection(EntityType::Orders, self.inner.scope),
        ));
        if let Err(err) = self.inner.invalidate_and_rerun().await {
            debug!(error = %err, "Re-running history page after status update failed");
        }
        Ok(updated)
    }
}

impl Drop for OrderHistory {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl HistoryInner {
    fn is_current(&self, epoch: u64) -> bool {
        self.mounted.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn realtime_callback(self: &Arc<Self>, epoch: u64) -> InvalidateFn {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            let Some(history) = weak.upgrade() else {
                return;
            };
            if !history.is_current(epoch) {
                debug!(epoch, "Ignoring history invalidation from a closed subscription");
                return;
            }
            tokio::spawn(async move {
                if !history.is_current(epoch) {
                    return;
                }
                if let Err(err) = history.invalidate_and_rerun().await {
                    debug!(error = %err, "Realtime history refresh failed");
                }
            });
        })
    }

    /// True when the window for the current query has expired and is not
    /// being fetched.
    fn expiry_check(self: &Arc<Self>, epoch: u64) -> ExpiryCheck {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            let Some(history) = weak.upgrade() else {
                return false;
            };
            if !history.is_current(epoch) {
                return false;
            }
            let settled = {
                let state = history.state.borrow();
                state.window.is_some() || state.error.is_some()
            };
            let key = mutex_lock(&history.query, SOURCE, "expiry_check").key(history.scope);
            let coordinator = &history.context.coordinator;
            settled && !coordinator.is_in_flight(&key) && !coordinator.store().is_live(&key)
        })
    }

    fn open_bridge(self: &Arc<Self>, epoch: u64) -> Connecting {
        let handle = InvalidationBridge::open_with_fallback(
            Arc::clone(&self.context.ports.feed),
            ChangeFilter::new(EntityType::Orders, self.scope.owner, self.scope.partition),
            self.context.reconnect_interval,
            self.realtime_callback(epoch),
            self.expiry_check(epoch),
        );
        let connecting = handle.connecting();
        let previous = mutex_lock(&self.bridge, SOURCE, "open_bridge").replace(handle);
        if let Some(previous) = previous {
            previous.close();
        }
        connecting
    }

    async fn invalidate_and_rerun(&self) -> Result<Arc<PageWindow<OrderRecord>>, FetchError> {
        self.context
            .coordinator
            .invalidate(&InvalidateScope::Prefix(history_prefix(
                EntityType::Orders,
                self.scope,
            )));
        let query = mutex_lock(&self.query, SOURCE, "invalidate_and_rerun").clone();
        self.run(query, LoadOptions::forced().silent()).await
    }

    async fn run(
        &self,
        query: HistoryQuery,
        options: LoadOptions<'_>,
    ) -> Result<Arc<PageWindow<OrderRecord>>, FetchError> {
        let key = query.key(self.scope);
        let signal = HistorySignal { history: self };
        let repo = Arc::clone(&self.context.ports.query);
        let scope = self.scope;
        let fetch_query = query.clone();

        let result = self
            .context
            .coordinator
            .load(
                &key,
                self.context.ttl,
                options.observed_by(&signal),
                move || fetch_page(Arc::clone(&repo), scope, fetch_query.clone()),
            )
            .await;

        self.apply(&query, &result);
        result
    }

    /// Publish a result if the view is mounted and still on `query`.
    fn apply(&self, query: &HistoryQuery, result: &Result<Arc<PageWindow<OrderRecord>>, FetchError>) {
        if !self.mounted.load(Ordering::SeqCst) {
            debug!("Dropping history result for unmounted view");
            return;
        }
        if *mutex_lock(&self.query, SOURCE, "apply") != *query {
            debug!(page = query.page.page(), "Dropping history result for a previous query");
            return;
        }
        self.state.send_modify(|state| match result {
            Ok(window) => {
                state.window = Some(Arc::clone(window));
                state.error = None;
            }
            Err(err) => state.error = Some(err.clone()),
        });
    }
}

struct HistorySignal<'a> {
    history: &'a HistoryInner,
}

impl LoadObserver for HistorySignal<'_> {
    fn loading(&self, active: bool) {
        if self.history.mounted.load(Ordering::SeqCst) {
            self.history.state.send_modify(|state| state.loading = active);
        }
    }
}

async fn fetch_page(
    repo: Arc<dyn QueryRepo>,
    scope: CollectionScope,
    query: HistoryQuery,
) -> Result<PageWindow<OrderRecord>, FetchError> {
    let table = EntityType::Orders.table();
    let filtered = query.select(scope);
    let ranged = filtered
        .clone()
        .order(query.order_by.clone())
        .range(query.page.range());

    let (total_count, rows) = futures::try_join!(repo.count(&filtered), repo.select(&ranged))
        .map_err(|err| FetchError::backend(table, &err))?;
    let rows = decode_rows::<OrderRecord>(table, rows)?;

    Ok(PageWindow {
        rows,
        total_count,
        has_more: query.page.has_more(total_count),
        page: query.page,
    })
}
