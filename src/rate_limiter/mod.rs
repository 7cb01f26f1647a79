//! Per-tier, per-resource rate limiting (spec.md §4.6). The algorithms
//! themselves (`token_bucket`, `sliding_window`) are pure math shared by every
//! `Store` backend; this module is the thin facade the coordinator calls,
//! translating a `RateLimitPolicy` into a `Store::check_rate_limit` request.

pub mod sliding_window;
pub mod token_bucket;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::{RateLimitRequest, Store};
use crate::types::{RateLimitPolicy, RateLimitStatus, Resource, UserId};

/// Evaluates rate-limit policies against a `Store`. Stateless; all state is
/// store-owned.
pub struct RateLimiter {
    store: Arc<dyn Store>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn request(
        user_id: &UserId,
        resource: &Resource,
        policy: &RateLimitPolicy,
        cost: u64,
        now: DateTime<Utc>,
    ) -> RateLimitRequest {
        RateLimitRequest {
            user_id: user_id.clone(),
            resource: resource.clone(),
            algorithm: policy.algorithm,
            cost,
            rate: policy.rate,
            window: policy.window,
            burst: policy.burst(),
            now,
        }
    }

    /// Atomically checks and, if admitted, deducts `cost` from the policy's
    /// bucket/window.
    pub async fn check(
        &self,
        user_id: &UserId,
        resource: &Resource,
        policy: &RateLimitPolicy,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus, StoreError> {
        self.store
            .check_rate_limit(Self::request(user_id, resource, policy, cost, now))
            .await
    }

    /// Read-only status, used to report rate-limit headers on the success
    /// path without a second consume.
    pub async fn peek(
        &self,
        user_id: &UserId,
        resource: &Resource,
        policy: &RateLimitPolicy,
        cost: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus, StoreError> {
        self.store
            .peek_rate_limit(Self::request(user_id, resource, policy, cost, now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::RateLimitAlgorithm;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn check_denies_once_burst_is_exhausted() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let policy = RateLimitPolicy {
            algorithm: RateLimitAlgorithm::TokenBucket,
            rate: 10,
            window: StdDuration::from_secs(1),
            burst: Some(5),
        };
        let user: UserId = "u1".into();
        let resource: Resource = "api_calls".into();
        let now = Utc::now();
        let mut admitted = 0;
        for _ in 0..10 {
            let status = limiter.check(&user, &resource, &policy, 1, now).await.expect("store call");
            if status.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
