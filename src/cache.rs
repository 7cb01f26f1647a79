//! Bounded, per-process cache for entitlements and usage snapshots (spec.md
//! §4.4). Two segments, each an LRU with per-entry TTL via `moka::sync::Cache`
//! — the teacher's own cache dependency (`tensorzero-core/Cargo.toml`'s
//! `moka = { workspace = true }`).
//!
//! The cache is never consulted to authorize a mutation (spec.md §3
//! "Ownership"); it only serves reads and fallback reads.

use std::time::Duration;

use moka::sync::Cache as MokaCache;

use crate::config::CacheConfig;
use crate::types::{Entitlement, Resource, Usage, UserId};

/// Snapshot statistics for observability/introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entitlement_hits: u64,
    pub entitlement_misses: u64,
    pub usage_hits: u64,
    pub usage_misses: u64,
}

struct Counters {
    entitlement_hits: std::sync::atomic::AtomicU64,
    entitlement_misses: std::sync::atomic::AtomicU64,
    usage_hits: std::sync::atomic::AtomicU64,
    usage_misses: std::sync::atomic::AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            entitlement_hits: std::sync::atomic::AtomicU64::new(0),
            entitlement_misses: std::sync::atomic::AtomicU64::new(0),
            usage_hits: std::sync::atomic::AtomicU64::new(0),
            usage_misses: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

/// Key for a cached usage snapshot: `(user, resource, period_key)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct UsageKey {
    user_id: UserId,
    resource: Resource,
    period_key: String,
}

/// The process-wide bounded cache, shared behind an `Arc` by the coordinator.
pub struct BoundedCache {
    entitlements: Option<MokaCache<UserId, Entitlement>>,
    usage: Option<MokaCache<UsageKey, Usage>>,
    counters: Counters,
}

impl BoundedCache {
    pub fn new(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self {
                entitlements: None,
                usage: None,
                counters: Counters::default(),
            };
        }
        let entitlements = MokaCache::builder()
            .max_capacity(config.max_entitlements)
            .time_to_live(config.entitlement_ttl)
            .build();
        let usage = MokaCache::builder()
            .max_capacity(config.max_usage)
            .time_to_live(config.usage_ttl)
            .build();
        Self {
            entitlements: Some(entitlements),
            usage: Some(usage),
            counters: Counters::default(),
        }
    }

    /// A disabled cache: every `get` misses, every `put`/`invalidate` is a no-op.
    pub fn disabled() -> Self {
        Self {
            entitlements: None,
            usage: None,
            counters: Counters::default(),
        }
    }

    pub fn get_entitlement(&self, user_id: &UserId) -> Option<Entitlement> {
        let Some(cache) = self.entitlements.as_ref() else {
            return None;
        };
        let result = cache.get(user_id);
        self.record(result.is_some(), true);
        result
    }

    pub fn put_entitlement(&self, entitlement: Entitlement) {
        if let Some(cache) = self.entitlements.as_ref() {
            cache.insert(entitlement.user_id.clone(), entitlement);
        }
    }

    pub fn invalidate_entitlement(&self, user_id: &UserId) {
        if let Some(cache) = self.entitlements.as_ref() {
            cache.invalidate(user_id);
        }
    }

    pub fn get_usage(&self, user_id: &UserId, resource: &Resource, period_key: &str) -> Option<Usage> {
        let Some(cache) = self.usage.as_ref() else {
            return None;
        };
        let key = UsageKey {
            user_id: user_id.clone(),
            resource: resource.clone(),
            period_key: period_key.to_string(),
        };
        let result = cache.get(&key);
        self.record(result.is_some(), false);
        result
    }

    pub fn put_usage(&self, user_id: &UserId, resource: &Resource, period_key: &str, usage: Usage) {
        if let Some(cache) = self.usage.as_ref() {
            let key = UsageKey {
                user_id: user_id.clone(),
                resource: resource.clone(),
                period_key: period_key.to_string(),
            };
            cache.insert(key, usage);
        }
    }

    pub fn invalidate_usage(&self, user_id: &UserId, resource: &Resource, period_key: &str) {
        if let Some(cache) = self.usage.as_ref() {
            let key = UsageKey {
                user_id: user_id.clone(),
                resource: resource.clone(),
                period_key: period_key.to_string(),
            };
            cache.invalidate(&key);
        }
    }

    fn record(&self, hit: bool, entitlement: bool) {
        use std::sync::atomic::Ordering::Relaxed;
        match (hit, entitlement) {
            (true, true) => self.counters.entitlement_hits.fetch_add(1, Relaxed),
            (false, true) => self.counters.entitlement_misses.fetch_add(1, Relaxed),
            (true, false) => self.counters.usage_hits.fetch_add(1, Relaxed),
            (false, false) => self.counters.usage_misses.fetch_add(1, Relaxed),
        };
    }

    pub fn stats(&self) -> CacheStats {
        use std::sync::atomic::Ordering::Relaxed;
        CacheStats {
            entitlement_hits: self.counters.entitlement_hits.load(Relaxed),
            entitlement_misses: self.counters.entitlement_misses.load(Relaxed),
            usage_hits: self.counters.usage_hits.load(Relaxed),
            usage_misses: self.counters.usage_misses.load(Relaxed),
        }
    }
}

/// Convenience for building a cache with a short TTL in tests.
#[cfg(test)]
pub fn test_cache(capacity: u64, ttl: Duration) -> BoundedCache {
    BoundedCache::new(&CacheConfig {
        enabled: true,
        entitlement_ttl: ttl,
        usage_ttl: ttl,
        max_entitlements: capacity,
        max_usage: capacity,
    })
}
