//! Cache configuration.
//!
//! TTLs are a safety net: realtime invalidation is the primary freshness
//! mechanism, so every entry still expires even if the change feed is down.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::types::EntityType;

const DEFAULT_MAX_ENTRIES: usize = 256;
const DEFAULT_ORDERS_TTL_MS: u64 = 30_000;
const DEFAULT_CUSTOMERS_TTL_MS: u64 = 60_000;
const DEFAULT_SERVICES_TTL_MS: u64 = 300_000;
const DEFAULT_PRODUCTS_TTL_MS: u64 = 120_000;
const DEFAULT_FRESH_READ_MS: u64 = 10_000;
const DEFAULT_HISTORY_STALENESS_MS: u64 = 5_000;
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 15_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve reads from the store. When off, every load goes to the backend
    /// (still single-flight).
    pub enabled: bool,
    /// Entries kept before least-recently-used eviction.
    pub max_entries: usize,
    pub orders_ttl_ms: u64,
    pub customers_ttl_ms: u64,
    pub services_ttl_ms: u64,
    pub products_ttl_ms: u64,
    /// Maximum age of a cached snapshot trusted on mount without refetching.
    pub fresh_read_ms: u64,
    /// Lifetime of a paginated window.
    pub history_staleness_ms: u64,
    /// Delay between change-feed reconnect attempts.
    pub reconnect_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            orders_ttl_ms: DEFAULT_ORDERS_TTL_MS,
            customers_ttl_ms: DEFAULT_CUSTOMERS_TTL_MS,
            services_ttl_ms: DEFAULT_SERVICES_TTL_MS,
            products_ttl_ms: DEFAULT_PRODUCTS_TTL_MS,
            fresh_read_ms: DEFAULT_FRESH_READ_MS,
            history_staleness_ms: DEFAULT_HISTORY_STALENESS_MS,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries.get(),
            orders_ttl_ms: settings.orders_ttl.as_millis() as u64,
            customers_ttl_ms: settings.customers_ttl.as_millis() as u64,
            services_ttl_ms: settings.services_ttl.as_millis() as u64,
            products_ttl_ms: settings.products_ttl.as_millis() as u64,
            fresh_read_ms: settings.fresh_read.as_millis() as u64,
            history_staleness_ms: settings.history_staleness.as_millis() as u64,
            reconnect_interval_ms: settings.reconnect_interval.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    /// TTL for a collection, by how often that entity changes.
    pub fn ttl_for(&self, entity: EntityType) -> Duration {
        let millis = match entity {
            EntityType::Orders => self.orders_ttl_ms,
            EntityType::Customers => self.customers_ttl_ms,
            EntityType::Services => self.services_ttl_ms,
            EntityType::Products => self.products_ttl_ms,
        };
        Duration::from_millis(millis)
    }

    pub fn fresh_read(&self) -> Duration {
        Duration::from_millis(self.fresh_read_ms)
    }

    pub fn history_staleness(&self) -> Duration {
        Duration::from_millis(self.history_staleness_ms)
    }

    /// Reconnect delay, never below 10ms so a broken feed cannot spin.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(10))
    }

    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_entries, 256);
        assert_eq!(config.ttl_for(EntityType::Services), Duration::from_secs(300));
        assert_eq!(config.ttl_for(EntityType::Orders), Duration::from_secs(30));
        assert_eq!(config.ttl_for(EntityType::Customers), Duration::from_secs(60));
        assert_eq!(config.fresh_read(), Duration::from_secs(10));
    }

    #[test]
    fn services_outlive_orders() {
        let config = CacheConfig::default();
        assert!(config.ttl_for(EntityType::Services) > config.ttl_for(EntityType::Orders));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }

    #[test]
    fn reconnect_interval_has_floor() {
        let config = CacheConfig {
            reconnect_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.reconnect_interval(), Duration::from_millis(10));
    }
}
