//! Error taxonomy. See spec.md §7 — policy rejections, validation, not-found,
//! availability and internal errors are distinct variants so the coordinator
//! can route each category correctly instead of pattern-matching strings.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{RateLimitStatus, Resource, TierName, Usage, UserId};

/// Errors a `Store` implementation reports back to the coordinator. Kept
/// separate from `QuotaError` so backend-specific failure shapes never leak
/// past the coordinator boundary.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("store operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("store returned an unexpected response: {message}")]
    Protocol { message: String },

    #[error("store serialization failure: {message}")]
    Serialization { message: String },
}

/// Snapshot attached to a `quota_exceeded` error so the caller can render a
/// useful response without a second store round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaExceededInfo {
    pub user_id: UserId,
    pub resource: Resource,
    pub usage: Usage,
}

/// Snapshot attached to a `rate_limit_exceeded` error, per spec.md §4.6.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitExceededInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    pub retry_after: chrono::Duration,
}

impl From<(RateLimitStatus, DateTime<Utc>)> for RateLimitExceededInfo {
    fn from((status, now): (RateLimitStatus, DateTime<Utc>)) -> Self {
        Self {
            limit: status.limit,
            remaining: status.remaining,
            reset_time: status.reset_time,
            retry_after: status.retry_after(now),
        }
    }
}

/// The public error type returned by every `QuotaCoordinator` operation.
#[derive(Error, Debug, Clone)]
pub enum QuotaError {
    /// Policy rejection: consuming would exceed the tier limit. Never retried.
    #[error("quota exceeded for user {} on resource {}", .info.user_id, .info.resource)]
    QuotaExceeded { info: Box<QuotaExceededInfo> },

    /// Policy rejection: the rate limiter denied the request. Never retried.
    #[error("rate limit exceeded: {} remaining of {}, retry after {:?}", .info.remaining, .info.limit, .info.retry_after)]
    RateLimitExceeded { info: RateLimitExceededInfo },

    /// Validation: `amount` was negative.
    #[error("invalid amount: {amount} (amount must be >= 0)")]
    InvalidAmount { amount: i64 },

    /// Validation: the entitlement names a tier absent from configuration.
    #[error("invalid tier: {tier} is not present in tier configuration")]
    InvalidTier { tier: TierName },

    /// Validation: a supplied period is internally inconsistent (end <= start).
    #[error("invalid period: start {start} is not before end {end}")]
    InvalidPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Not-found: distinguishable from a store failure so callers can apply
    /// the default tier deliberately instead of treating it as unavailability.
    #[error("no entitlement found for user {user_id}")]
    EntitlementNotFound { user_id: UserId },

    /// Availability: every fallback strategy was attempted and exhausted, or
    /// fallback is disabled. Only surfaced after exhaustion.
    #[error("storage unavailable and no fallback strategy succeeded: {source}")]
    StorageUnavailable { source: StoreError },

    /// Availability: a cache-fallback response is older than `max_staleness`.
    #[error("cached value is stale: age {age_ms}ms exceeds max_staleness {max_staleness_ms}ms")]
    StaleCache { age_ms: u64, max_staleness_ms: u64 },

    /// Availability: the optimistic-allowance fallback would exceed its bound.
    #[error("optimistic allowance exceeded for user {user_id} on resource {resource}")]
    OptimisticLimitExceeded { user_id: UserId, resource: Resource },

    /// Availability: no fallback strategy is configured/enabled at all.
    #[error("no fallback strategy is available")]
    FallbackUnavailable,

    /// The caller's cancellation token fired before the mutation committed.
    /// Never returned once `consume_quota`/`refund_quota` has returned
    /// successfully — per spec.md §5, cancellation is cooperative only up to
    /// the atomic boundary.
    #[error("operation cancelled before it committed")]
    Cancelled,

    /// Internal: serialization failures, unexpected script responses, bugs.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl QuotaError {
    /// True for the availability category (spec.md §7): these are the only
    /// errors the fallback chain is allowed to intercept.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            QuotaError::StorageUnavailable { .. }
                | QuotaError::StaleCache { .. }
                | QuotaError::OptimisticLimitExceeded { .. }
                | QuotaError::FallbackUnavailable
        )
    }
}

impl From<StoreError> for QuotaError {
    fn from(source: StoreError) -> Self {
        QuotaError::StorageUnavailable { source }
    }
}
