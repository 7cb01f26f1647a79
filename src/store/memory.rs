//! In-memory reference `Store` implementation. Plays the role the teacher's
//! mock `ClickHouseConnectionInfo`/`PostgresConnectionInfo` play in its own
//! test suite: single-process, fully atomic, used by unit/property tests and
//! as a secondary store in the fallback chain.
//!
//! All state lives behind one `std::sync::Mutex`, held only across the
//! synchronous critical section of each call (never across an `.await`
//! point), which is sufficient for a single-process reference backend and
//! keeps every primitive trivially atomic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::rate_limiter::{sliding_window, token_bucket};
use crate::types::{
    Entitlement, IdempotencyKey, IdempotencyRecord, Period, RateLimitAlgorithm, RateLimitStatus,
    RefundKey, RefundRecord, Resource, SlidingWindowState, TokenBucketState, Usage, UserId,
};

use super::{
    ConsumeOutcome, ConsumeRequest, RateLimitRequest, RefundOutcome, RefundRequest, Store,
    TierChangeRequest,
};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct UsageKey {
    user_id: UserId,
    resource: Resource,
    period_key: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct RateLimitKey {
    user_id: UserId,
    resource: Resource,
}

#[derive(Default)]
struct State {
    entitlements: HashMap<UserId, Entitlement>,
    usage: HashMap<UsageKey, Usage>,
    idempotency: HashMap<String, IdempotencyRecord>,
    refunds: HashMap<String, RefundRecord>,
    token_buckets: HashMap<RateLimitKey, TokenBucketState>,
    sliding_windows: HashMap<RateLimitKey, SlidingWindowState>,
}

/// A single-process, fully in-memory `Store`. Intended for tests and as a
/// fallback secondary store; not durable.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn evaluate_rate_limit(
    state: &mut State,
    request: &RateLimitRequest,
    mutate: bool,
) -> RateLimitStatus {
    let key = RateLimitKey {
        user_id: request.user_id.clone(),
        resource: request.resource.clone(),
    };
    match request.algorithm {
        RateLimitAlgorithm::TokenBucket => {
            let current = state.token_buckets.get(&key).copied();
            let (status, next) = token_bucket::apply(
                current,
                request.cost,
                request.rate,
                request.window,
                request.burst,
                request.now,
                mutate,
            );
            if let Some(next) = next {
                state.token_buckets.insert(key, next);
            }
            status
        }
        RateLimitAlgorithm::SlidingWindow => {
            let current = state.sliding_windows.get(&key).cloned();
            let (status, next) = sliding_window::apply(
                current.as_ref(),
                request.rate,
                request.window,
                request.now,
                mutate,
            );
            if let Some(next) = next {
                state.sliding_windows.insert(key, next);
            }
            status
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_entitlement(&self, user_id: &UserId) -> Result<Option<Entitlement>, StoreError> {
        Ok(self.lock().entitlements.get(user_id).cloned())
    }

    async fn set_entitlement(&self, entitlement: Entitlement) -> Result<(), StoreError> {
        self.lock().entitlements.insert(entitlement.user_id.clone(), entitlement);
        Ok(())
    }

    async fn get_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
    ) -> Result<Option<Usage>, StoreError> {
        let key = UsageKey {
            user_id: user_id.clone(),
            resource: resource.clone(),
            period_key: period.period_key(),
        };
        Ok(self.lock().usage.get(&key).cloned())
    }

    async fn set_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
        usage: Usage,
    ) -> Result<(), StoreError> {
        let key = UsageKey {
            user_id: user_id.clone(),
            resource: resource.clone(),
            period_key: period.period_key(),
        };
        self.lock().usage.insert(key, usage);
        Ok(())
    }

    async fn consume_quota(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        let mut state = self.lock();

        if let Some(idempotency_key) = &request.idempotency_key {
            if let Some(record) = state.idempotency.get(&idempotency_key.0) {
                return Ok(ConsumeOutcome::IdempotentReplay {
                    new_used: record.new_used,
                });
            }
        }

        let key = UsageKey {
            user_id: request.user_id.clone(),
            resource: request.resource.clone(),
            period_key: request.period.period_key(),
        };
        let mut usage = state.usage.get(&key).cloned().unwrap_or(Usage {
            used: 0,
            limit: request.limit,
            tier: request.tier.clone(),
            updated_at: request.now,
        });

        if let Some(limit) = usage.limit {
            if usage.used + request.amount > limit {
                return Ok(ConsumeOutcome::QuotaExceeded {
                    current_used: usage.used,
                });
            }
        }

        usage.used += request.amount;
        usage.updated_at = request.now;
        let new_used = usage.used;
        state.usage.insert(key, usage);

        if let Some(idempotency_key) = request.idempotency_key {
            state.idempotency.insert(
                idempotency_key.0,
                IdempotencyRecord {
                    new_used,
                    timestamp: request.now,
                },
            );
        }

        Ok(ConsumeOutcome::Ok { new_used })
    }

    async fn refund_quota(&self, request: RefundRequest) -> Result<RefundOutcome, StoreError> {
        let mut state = self.lock();

        if state.refunds.contains_key(&request.refund_key.0) {
            return Ok(RefundOutcome::IdempotentReplay);
        }

        let key = UsageKey {
            user_id: request.user_id.clone(),
            resource: request.resource.clone(),
            period_key: request.period.period_key(),
        };
        let mut usage = state.usage.get(&key).cloned().unwrap_or(Usage {
            used: 0,
            limit: None,
            tier: "unknown".into(),
            updated_at: request.now,
        });
        usage.used = usage.used.saturating_sub(request.amount);
        usage.updated_at = request.now;
        let new_used = usage.used;
        state.usage.insert(key, usage);

        state.refunds.insert(
            request.refund_key.0.clone(),
            RefundRecord {
                user_id: request.user_id,
                resource: request.resource,
                amount: request.amount,
                period: request.period,
                reason: request.reason,
                timestamp: request.now,
            },
        );

        Ok(RefundOutcome::Ok { new_used })
    }

    async fn get_refund_record(&self, key: &RefundKey) -> Result<Option<RefundRecord>, StoreError> {
        Ok(self.lock().refunds.get(&key.0).cloned())
    }

    async fn get_consumption_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.lock().idempotency.get(&key.0).cloned())
    }

    async fn apply_tier_change(&self, request: TierChangeRequest) -> Result<(), StoreError> {
        let key = UsageKey {
            user_id: request.user_id,
            resource: request.resource,
            period_key: request.period.period_key(),
        };
        self.lock().usage.insert(
            key,
            Usage {
                used: request.new_used,
                limit: request.new_limit,
                tier: request.new_tier,
                updated_at: request.now,
            },
        );
        Ok(())
    }

    async fn check_rate_limit(&self, request: RateLimitRequest) -> Result<RateLimitStatus, StoreError> {
        let mut state = self.lock();
        Ok(evaluate_rate_limit(&mut state, &request, true))
    }

    async fn peek_rate_limit(&self, request: RateLimitRequest) -> Result<RateLimitStatus, StoreError> {
        let mut state = self.lock();
        Ok(evaluate_rate_limit(&mut state, &request, false))
    }

    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RateLimitAlgorithm, RefundReason, TierName};
    use std::time::Duration as StdDuration;

    fn period(start: DateTime<Utc>) -> Period {
        Period {
            start,
            end: start + chrono::Duration::days(30),
            period_type: crate::types::PeriodType::Monthly,
        }
    }

    #[tokio::test]
    async fn consume_is_atomic_up_to_limit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let p = period(now);
        for _ in 0..10 {
            let outcome = store
                .consume_quota(ConsumeRequest {
                    user_id: "u1".into(),
                    resource: "api_calls".into(),
                    amount: 10,
                    period: p,
                    limit: Some(100),
                    tier: TierName::from("free"),
                    idempotency_key: None,
                    now,
                })
                .await
                .expect("store call");
            assert!(matches!(outcome, ConsumeOutcome::Ok { .. }));
        }
        let outcome = store
            .consume_quota(ConsumeRequest {
                user_id: "u1".into(),
                resource: "api_calls".into(),
                amount: 1,
                period: p,
                limit: Some(100),
                tier: TierName::from("free"),
                idempotency_key: None,
                now,
            })
            .await
            .expect("store call");
        assert!(matches!(outcome, ConsumeOutcome::QuotaExceeded { current_used: 100 }));
    }

    #[tokio::test]
    async fn idempotent_replay_does_not_mutate() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let p = period(now);
        let req = |key: &str| ConsumeRequest {
            user_id: "u1".into(),
            resource: "api_calls".into(),
            amount: 5,
            period: p,
            limit: Some(100),
            tier: TierName::from("free"),
            idempotency_key: Some(key.into()),
            now,
        };
        let first = store.consume_quota(req("k1")).await.expect("store call");
        assert_eq!(first, ConsumeOutcome::Ok { new_used: 5 });
        let replay = store.consume_quota(req("k1")).await.expect("store call");
        assert_eq!(replay, ConsumeOutcome::IdempotentReplay { new_used: 5 });
        let usage = store
            .get_usage(&"u1".into(), &"api_calls".into(), &p)
            .await
            .expect("store call")
            .expect("usage row exists");
        assert_eq!(usage.used, 5);
    }

    #[tokio::test]
    async fn refund_replay_is_a_no_op() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let p = period(now);
        store
            .consume_quota(ConsumeRequest {
                user_id: "u1".into(),
                resource: "api_calls".into(),
                amount: 10,
                period: p,
                limit: Some(100),
                tier: TierName::from("free"),
                idempotency_key: None,
                now,
            })
            .await
            .expect("store call");

        let refund_req = RefundRequest {
            user_id: "u1".into(),
            resource: "api_calls".into(),
            amount: 4,
            period: p,
            refund_key: "r1".into(),
            reason: RefundReason::from("test"),
            now,
        };
        let outcome = store.refund_quota(refund_req.clone()).await.expect("store call");
        assert_eq!(outcome, RefundOutcome::Ok { new_used: 6 });
        let replay = store.refund_quota(refund_req).await.expect("store call");
        assert_eq!(replay, RefundOutcome::IdempotentReplay);
        let usage = store
            .get_usage(&"u1".into(), &"api_calls".into(), &p)
            .await
            .expect("store call")
            .expect("usage row exists");
        assert_eq!(usage.used, 6);
    }

    #[tokio::test]
    async fn token_bucket_admits_up_to_burst_then_denies() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut admitted = 0;
        for _ in 0..25 {
            let status = store
                .check_rate_limit(RateLimitRequest {
                    user_id: "u1".into(),
                    resource: "api_calls".into(),
                    algorithm: RateLimitAlgorithm::TokenBucket,
                    cost: 1,
                    rate: 10,
                    window: StdDuration::from_secs(1),
                    burst: 20,
                    now,
                })
                .await
                .expect("store call");
            if status.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
    }

    #[tokio::test]
    async fn token_bucket_refills_after_quiescence() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..20 {
            store
                .check_rate_limit(RateLimitRequest {
                    user_id: "u1".into(),
                    resource: "api_calls".into(),
                    algorithm: RateLimitAlgorithm::TokenBucket,
                    cost: 1,
                    rate: 10,
                    window: StdDuration::from_secs(1),
                    burst: 20,
                    now,
                })
                .await
                .expect("store call");
        }
        let later = now + chrono::Duration::seconds(5);
        let status = store
            .check_rate_limit(RateLimitRequest {
                user_id: "u1".into(),
                resource: "api_calls".into(),
                algorithm: RateLimitAlgorithm::TokenBucket,
                cost: 20,
                rate: 10,
                window: StdDuration::from_secs(1),
                burst: 20,
                now: later,
            })
            .await
            .expect("store call");
        assert!(status.allowed, "full burst should be available after quiescence");
    }

    #[tokio::test]
    async fn sliding_window_never_admits_more_than_rate_per_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut admitted = 0;
        for i in 0..15 {
            let t = now + chrono::Duration::milliseconds(i * 10);
            let status = store
                .check_rate_limit(RateLimitRequest {
                    user_id: "u1".into(),
                    resource: "api_calls".into(),
                    algorithm: RateLimitAlgorithm::SlidingWindow,
                    cost: 1,
                    rate: 10,
                    window: StdDuration::from_secs(1),
                    burst: 10,
                    now: t,
                })
                .await
                .expect("store call");
            if status.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn peek_rate_limit_does_not_mutate_state() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = RateLimitRequest {
            user_id: "u1".into(),
            resource: "api_calls".into(),
            algorithm: RateLimitAlgorithm::TokenBucket,
            cost: 5,
            rate: 10,
            window: StdDuration::from_secs(1),
            burst: 20,
            now,
        };
        let peeked = store.peek_rate_limit(request.clone()).await.expect("store call");
        assert!(peeked.allowed);
        let peeked_again = store.peek_rate_limit(request).await.expect("store call");
        assert_eq!(peeked, peeked_again);
    }
}
