//! The storage contract the core depends on (spec.md §4.1). Only the
//! interface is specified here; concrete backends (`memory`, and the
//! feature-gated `postgres`) are reference implementations, not the focus of
//! this crate.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    Entitlement, IdempotencyKey, IdempotencyRecord, Period, RateLimitAlgorithm, RateLimitStatus,
    RefundKey, RefundRecord, RefundReason, Resource, TierName, Usage, UserId,
};

/// A request to atomically consume `amount` units of `resource` for `user_id`
/// within `period`, enforcing `limit` (when set) and deduplicating on
/// `idempotency_key` (when set).
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumeRequest {
    pub user_id: UserId,
    pub resource: Resource,
    pub amount: u64,
    pub period: Period,
    pub limit: Option<u64>,
    pub tier: TierName,
    pub idempotency_key: Option<IdempotencyKey>,
    pub now: DateTime<Utc>,
}

/// Outcome of `Store::consume_quota`.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsumeOutcome {
    Ok { new_used: u64 },
    QuotaExceeded { current_used: u64 },
    IdempotentReplay { new_used: u64 },
}

/// A request to atomically refund `amount` units, deduplicating on `refund_key`.
#[derive(Clone, Debug, PartialEq)]
pub struct RefundRequest {
    pub user_id: UserId,
    pub resource: Resource,
    pub amount: u64,
    pub period: Period,
    pub refund_key: RefundKey,
    pub reason: RefundReason,
    pub now: DateTime<Utc>,
}

/// Outcome of `Store::refund_quota`.
#[derive(Clone, Debug, PartialEq)]
pub enum RefundOutcome {
    Ok { new_used: u64 },
    IdempotentReplay,
}

/// Atomic replacement of `{limit, tier}` for one usage row, used by tier-change
/// proration (spec.md §4.9).
#[derive(Clone, Debug, PartialEq)]
pub struct TierChangeRequest {
    pub user_id: UserId,
    pub resource: Resource,
    pub period: Period,
    pub new_tier: TierName,
    pub new_limit: Option<u64>,
    pub new_used: u64,
    pub now: DateTime<Utc>,
}

/// A request to atomically check (and, if `consume`, deduct) rate-limit state
/// for `(user, resource)`.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitRequest {
    pub user_id: UserId,
    pub resource: Resource,
    pub algorithm: RateLimitAlgorithm,
    pub cost: u64,
    pub rate: u64,
    pub window: std::time::Duration,
    pub burst: u64,
    pub now: DateTime<Utc>,
}

/// Storage contract the coordinator depends on. Every operation must be
/// atomic with respect to concurrent callers sharing the same backing store
/// (spec.md §4.1); no cross-operation atomicity is required.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_entitlement(&self, user_id: &UserId) -> Result<Option<Entitlement>, StoreError>;
    async fn set_entitlement(&self, entitlement: Entitlement) -> Result<(), StoreError>;

    async fn get_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
    ) -> Result<Option<Usage>, StoreError>;

    /// Administrative override — not part of the atomic consume path.
    async fn set_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
        usage: Usage,
    ) -> Result<(), StoreError>;

    async fn consume_quota(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError>;

    async fn refund_quota(&self, request: RefundRequest) -> Result<RefundOutcome, StoreError>;

    async fn get_refund_record(&self, key: &RefundKey) -> Result<Option<RefundRecord>, StoreError>;

    async fn get_consumption_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn apply_tier_change(&self, request: TierChangeRequest) -> Result<(), StoreError>;

    /// Atomically checks the rate limit and, if admitted, deducts `cost`.
    async fn check_rate_limit(&self, request: RateLimitRequest) -> Result<RateLimitStatus, StoreError>;

    /// Read-only variant of `check_rate_limit`: reports the status a call
    /// would get without mutating state. Resolves the Open Question in
    /// spec.md §9 about emitting rate-limit headers on the success path
    /// without a double-consume.
    async fn peek_rate_limit(&self, request: RateLimitRequest) -> Result<RateLimitStatus, StoreError>;

    /// Authoritative clock. Implementations may defer to local time.
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;
}
