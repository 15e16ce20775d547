//! Entry point for building collection views.
//!
//! A hub owns the one store and coordinator of a process and hands them to
//! every view it creates, so views for the same owner and partition share
//! cache entries and in-flight fetches.

use std::sync::Arc;

use uuid::Uuid;

use crate::application::collection::{CollectionView, ViewContext};
use crate::application::history::{HistoryQuery, OrderHistory};
use crate::application::orders::OrderCollection;
use crate::application::repos::BackendPorts;
use crate::cache::{
    CacheConfig, Clock, CollectionScope, FetchCoordinator, InvalidateScope, SystemClock, TtlStore,
};
use crate::domain::entities::{CustomerRecord, ProductRecord, Record, ServiceRecord};
use crate::domain::types::{BusinessType, EntityType};

#[derive(Clone)]
pub struct CollectionHub {
    coordinator: Arc<FetchCoordinator>,
    ports: BackendPorts,
    config: CacheConfig,
}

impl CollectionHub {
    pub fn new(ports: BackendPorts, config: CacheConfig) -> Self {
        Self::with_clock(ports, config, Arc::new(SystemClock))
    }

    pub fn with_clock(ports: BackendPorts, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(TtlStore::new(&config, clock));
        let coordinator = Arc::new(FetchCoordinator::new(store, config.enabled));
        Self {
            coordinator,
            ports,
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<TtlStore> {
        self.coordinator.store()
    }

    pub fn ports(&self) -> &BackendPorts {
        &self.ports
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Drop cached entries across every view of this hub.
    pub fn invalidate(&self, scope: &InvalidateScope) -> usize {
        self.coordinator.invalidate(scope)
    }

    fn context(&self, entity: EntityType) -> ViewContext {
        ViewContext {
            coordinator: Arc::clone(&self.coordinator),
            ports: self.ports.clone(),
            ttl: self.config.ttl_for(entity),
            fresh_read: self.config.fresh_read(),
            reconnect_interval: self.config.reconnect_interval(),
        }
    }

    /// An unmounted view of any record type.
    pub fn view<R: Record>(&self, scope: CollectionScope) -> CollectionView<R> {
        CollectionView::new(self.context(R::ENTITY), scope)
    }

    pub fn orders(&self, owner: Uuid, business_type: BusinessType) -> OrderCollection {
        let view = self.view(CollectionScope::new(owner, Some(business_type)));
        OrderCollection::new(view, Arc::clone(&self.ports.rpc))
    }

    pub fn customers(
        &self,
        owner: Uuid,
        business_type: Option<BusinessType>,
    ) -> CollectionView<CustomerRecord> {
        self.view(CollectionScope::new(owner, business_type))
    }

    pub fn services(
        &self,
        owner: Uuid,
        business_type: Option<BusinessType>,
    ) -> CollectionView<ServiceRecord> {
        self.view(CollectionScope::new(owner, business_type))
    }

    pub fn products(&self, owner: Uuid) -> CollectionView<ProductRecord> {
        self.view(CollectionScope::new(owner, None))
    }

    pub fn order_history(
        &self,
        owner: Uuid,
        business_type: Option<BusinessType>,
        query: HistoryQuery,
    ) -> OrderHistory {
        let context = ViewContext {
            ttl: self.config.history_staleness(),
            ..self.context(EntityType::Orders)
        };
        OrderHistory::new(context, CollectionScope::new(owner, business_type), query)
    }
}
