//! Ports to the backend: row queries, row mutations, the change feed and
//! remote procedure calls.
//!
//! Rows cross these ports as JSON objects. Typed decoding happens in the
//! collection views so one adapter serves every table.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::application::pagination::{PaginationError, RowRange};
use crate::cache::{ChangeEvent, ChangeFilter, SubscriptionError};
use crate::domain::entities::OrderBy;

/// Column holding the row owner on every table.
pub const OWNER_COLUMN: &str = "user_id";
/// Column holding the business partition on partitioned tables.
pub const PARTITION_COLUMN: &str = "business_type";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("backend error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("not authorized: {message}")]
    Unauthorized { message: String },
    #[error("backend timeout")]
    Timeout,
    #[error(transparent)]
    Pagination(#[from] PaginationError),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    /// Case-insensitive `LIKE`; `*` and `%` are wildcards.
    ILike,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    pub column: Cow<'static, str>,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn eq(column: &'static str, value: impl ToString) -> Self {
        Self {
            column: Cow::Borrowed(column),
            op: FilterOp::Eq,
            value: value.to_string(),
        }
    }

    /// Substring match on `column`.
    pub fn contains(column: &'static str, needle: &str) -> Self {
        Self {
            column: Cow::Borrowed(column),
            op: FilterOp::ILike,
            value: format!("*{needle}*"),
        }
    }
}

/// A select against one table, always scoped to an owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectQuery {
    pub table: &'static str,
    pub owner: Uuid,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub range: Option<RowRange>,
}

impl SelectQuery {
    pub fn new(table: &'static str, owner: Uuid) -> Self {
        Self {
            table,
            owner,
            filters: Vec::new(),
            order_by: None,
            range: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn range(mut self, range: RowRange) -> Self {
        self.range = Some(range);
        self
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, SubscriptionError>>;

#[async_trait]
pub trait QueryRepo: Send + Sync {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, RepoError>;

    /// Number of rows matching the query's owner and filters; range and
    /// ordering are ignored.
    async fn count(&self, query: &SelectQuery) -> Result<u64, RepoError>;
}

#[async_trait]
pub trait MutationRepo: Send + Sync {
    /// Insert `record` (which carries its own owner column) and return the
    /// stored row with backend-assigned fields.
    async fn insert(&self, table: &'static str, record: Value) -> Result<Value, RepoError>;

    /// Apply a partial patch. Only the fields present in `patch` change.
    async fn update(
        &self,
        table: &'static str,
        owner: Uuid,
        id: Uuid,
        patch: Value,
    ) -> Result<Value, RepoError>;

    async fn delete(&self, table: &'static str, owner: Uuid, id: Uuid) -> Result<(), RepoError>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: &ChangeFilter) -> Result<ChangeStream, SubscriptionError>;
}

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, name: &str, args: Value) -> Result<Value, RepoError>;
}

/// Everything a full backend adapter provides.
pub trait Backend: QueryRepo + MutationRepo + ChangeFeed + RpcClient {}

impl<T> Backend for T where T: QueryRepo + MutationRepo + ChangeFeed + RpcClient {}

/// The four ports as separately shareable handles.
#[derive(Clone)]
pub struct BackendPorts {
    pub query: Arc<dyn QueryRepo>,
    pub mutation: Arc<dyn MutationRepo>,
    pub feed: Arc<dyn ChangeFeed>,
    pub rpc: Arc<dyn RpcClient>,
}

impl BackendPorts {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: Backend + 'static,
    {
        Self {
            query: backend.clone(),
            mutation: backend.clone(),
            feed: backend.clone(),
            rpc: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pagination::PageRequest;

    #[test]
    fn select_query_builder_accumulates() {
        let owner = Uuid::from_u128(9);
        let range = PageRequest::new(2, 5).unwrap().range();
        let query = SelectQuery::new("orders", owner)
            .filter(Filter::eq(PARTITION_COLUMN, "laundry"))
            .filter(Filter::contains("customer_name", "sari"))
            .order(OrderBy::desc("created_at"))
            .range(range);

        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[1].op, FilterOp::ILike);
        assert_eq!(query.filters[1].value, "*sari*");
        assert_eq!(query.range, Some(RowRange { offset: 5, limit: 5 }));
    }
}
