//! Client-side collection cache.
//!
//! - [`TtlStore`]: one process-wide map of immutable snapshots with per-entry
//!   TTL and LRU capacity.
//! - [`FetchCoordinator`]: single-flight loads in front of the store.
//! - [`InvalidationBridge`]: change-feed subscriptions that call back when a
//!   relevant row changes.
//!
//! TTLs only bound staleness when the change feed is unavailable; the bridge
//! drives freshness, and while its feed is down it re-reads snapshots once
//! they expire. Configuration lives in `kasirpro.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_entries = 256
//! orders_ttl_ms = 30000
//! services_ttl_ms = 300000
//! # ... see config.rs for all options
//! ```

mod bridge;
mod clock;
mod config;
mod coordinator;
mod error;
mod events;
mod keys;
pub(crate) mod lock;
mod store;

pub use bridge::{
    BridgeHandle, CONNECT_WAIT, Connecting, ExpiryCheck, InvalidateFn, InvalidationBridge,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use coordinator::{FetchCoordinator, LoadObserver, LoadOptions};
pub use error::{FetchError, SubscriptionError};
pub use events::{ChangeEvent, ChangeFilter, ChangeKind, RawChange, RowImage};
pub use keys::{CacheKey, CollectionScope, InvalidateScope, hash_value, history_prefix};
pub use store::{CacheEntry, Payload, TtlStore};
