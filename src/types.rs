//! Core data model: entitlements, tiers, periods, usage and ledger records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque per-user identifier. Newtype so call sites can't accidentally swap
/// a user id for a resource name or idempotency key.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A metered resource name, e.g. `"api_calls"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource(pub String);

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Resource {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Resource {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Caller-supplied opaque token guaranteeing at-most-once consume semantics.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Generates a fresh, time-ordered key for callers with no natural
    /// dedup token of their own to supply.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Caller-supplied opaque token guaranteeing at-most-once refund semantics.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefundKey(pub String);

impl RefundKey {
    /// Generates a fresh, time-ordered key for callers with no natural
    /// dedup token of their own to supply.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for RefundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RefundKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Named policy bundle: limits, rate-limit configuration, warning thresholds.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TierName(pub String);

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TierName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Declaration that a user belongs to a named tier as of a subscription anniversary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: UserId,
    pub tier: TierName,
    pub subscription_start_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The kind of billing period a limit is measured over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Monthly,
    /// Non-expiring period used for granted, one-time credits.
    Forever,
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeriodType::Daily => "daily",
            PeriodType::Monthly => "monthly",
            PeriodType::Forever => "forever",
        };
        write!(f, "{s}")
    }
}

/// A half-open time interval over which usage accumulates. Computed, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_type: PeriodType,
}

impl Period {
    /// Backend-stable key derived from the period's start and type. Two calls
    /// computing the same logical period must derive the same key so usage
    /// rows line up across processes.
    pub fn period_key(&self) -> String {
        match self.period_type {
            PeriodType::Daily => format!("daily:{}", self.start.format("%Y-%m-%d")),
            PeriodType::Monthly => format!("monthly:{}", self.start.format("%Y-%m-%d")),
            PeriodType::Forever => "forever".to_string(),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Rate-limit algorithm selection, per tier and resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
}

/// Per-tier, per-resource rate-limit policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub algorithm: RateLimitAlgorithm,
    /// Requests (or tickets) admitted per `window`.
    pub rate: u64,
    #[serde(with = "crate::serde_util::seconds")]
    pub window: std::time::Duration,
    /// Token bucket burst capacity. Defaults to `rate` when unset.
    pub burst: Option<u64>,
}

impl RateLimitPolicy {
    pub fn burst(&self) -> u64 {
        self.burst.unwrap_or(self.rate)
    }

    /// `window` as a `chrono::Duration`, for arithmetic against `DateTime<Utc>`.
    pub fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero())
    }
}

/// Process-wide, read-only policy bundle for one tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub monthly_quotas: BTreeMap<String, u64>,
    pub daily_quotas: BTreeMap<String, u64>,
    pub rate_limits: BTreeMap<String, RateLimitPolicy>,
    /// Sorted ascending, values in (0, 1).
    pub warning_thresholds: BTreeMap<String, Vec<f64>>,
}

impl TierConfig {
    pub fn quota_for(&self, resource: &Resource, period_type: PeriodType) -> Option<u64> {
        match period_type {
            PeriodType::Daily => self.daily_quotas.get(&resource.0).copied(),
            PeriodType::Monthly => self.monthly_quotas.get(&resource.0).copied(),
            PeriodType::Forever => None,
        }
    }

    pub fn rate_limit_for(&self, resource: &Resource) -> Option<&RateLimitPolicy> {
        self.rate_limits.get(&resource.0)
    }

    pub fn thresholds_for(&self, resource: &Resource) -> &[f64] {
        self.warning_thresholds
            .get(&resource.0)
            .map_or(&[], Vec::as_slice)
    }
}

/// Per `(user, resource, period)` usage accounting row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub used: u64,
    /// `None` means unlimited for this triple.
    pub limit: Option<u64>,
    pub tier: TierName,
    pub updated_at: DateTime<Utc>,
}

impl Usage {
    pub fn ratio(&self) -> Option<f64> {
        self.limit.and_then(|limit| {
            if limit == 0 {
                None
            } else {
                Some(self.used as f64 / limit as f64)
            }
        })
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.used))
    }
}

/// Recorded outcome of the consume that first used a given idempotency key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub new_used: u64,
    pub timestamp: DateTime<Utc>,
}

/// Why a refund was issued. Free-form, but kept as a dedicated type so callers
/// can't confuse it with other string fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RefundReason(pub String);

impl From<&str> for RefundReason {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Durable record of a processed refund, keyed by `RefundKey`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub user_id: UserId,
    pub resource: Resource,
    pub amount: u64,
    pub period: Period,
    pub reason: RefundReason,
    pub timestamp: DateTime<Utc>,
}

/// Token-bucket state persisted per `(user, resource)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

/// Sliding-window state persisted per `(user, resource)`: timestamps of
/// admitted calls still inside the current window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub timestamps: Vec<DateTime<Utc>>,
}

/// Outcome of an atomic rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitStatus {
    pub fn retry_after(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.reset_time - now).max(chrono::Duration::zero())
    }
}
