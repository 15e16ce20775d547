//! Cache key definitions.
//!
//! Keys are rendered strings so that invalidation can match by exact key,
//! prefix or substring. Collection keys look like `orders_laundry:<owner>`;
//! paginated windows live under `history:` with page, size and filter hash
//! appended so two pages never share an entry.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use crate::domain::types::{BusinessType, EntityType};

const HISTORY_PREFIX: &str = "history:";

/// Owner plus optional business partition a view is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionScope {
    pub owner: Uuid,
    pub partition: Option<BusinessType>,
}

impl CollectionScope {
    pub fn new(owner: Uuid, partition: Option<BusinessType>) -> Self {
        Self { owner, partition }
    }

    /// Drops the partition for entities that are not partitioned.
    pub fn for_entity(self, entity: EntityType) -> Self {
        if entity.is_partitioned() {
            self
        } else {
            Self {
                owner: self.owner,
                partition: None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a whole collection snapshot.
    pub fn collection(entity: EntityType, scope: CollectionScope) -> Self {
        let scope = scope.for_entity(entity);
        Self(format!("{}:{}", collection_stem(entity, scope.partition), scope.owner))
    }

    /// Key for one window of a paginated query.
    pub fn page(
        entity: EntityType,
        scope: CollectionScope,
        page: u32,
        page_size: u32,
        query_hash: u64,
    ) -> Self {
        Self(format!(
            "{}p{page}:s{page_size}:q{query_hash:016x}",
            history_prefix(entity, scope)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn collection_stem(entity: EntityType, partition: Option<BusinessType>) -> String {
    match partition {
        Some(partition) => format!("{}_{}", entity.as_str(), partition.as_str()),
        None => entity.as_str().to_string(),
    }
}

/// Prefix shared by every paginated window of one owner and partition.
pub fn history_prefix(entity: EntityType, scope: CollectionScope) -> String {
    let scope = scope.for_entity(entity);
    format!(
        "{HISTORY_PREFIX}{}:{}:",
        collection_stem(entity, scope.partition),
        scope.owner
    )
}

/// Which entries an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidateScope {
    Key(CacheKey),
    Prefix(String),
    Contains(String),
    All,
}

impl InvalidateScope {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            InvalidateScope::Key(exact) => exact == key,
            InvalidateScope::Prefix(prefix) => key.as_str().starts_with(prefix.as_str()),
            InvalidateScope::Contains(fragment) => key.as_str().contains(fragment.as_str()),
            InvalidateScope::All => true,
        }
    }
}

impl From<CacheKey> for InvalidateScope {
    fn from(key: CacheKey) -> Self {
        InvalidateScope::Key(key)
    }
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
