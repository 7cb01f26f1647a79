//! Per-user consumption quota and rate-limit enforcement core for a
//! horizontally-scaled service.
//!
//! The [`QuotaCoordinator`] is the single entry point: it composes entitlement
//! lookup, billing-cycle calculation, atomic usage accounting, a dual-algorithm
//! rate limiter, idempotency/refund ledgers, a bounded cache, a circuit
//! breaker and a fallback policy behind one `consume`/`refund` surface.
//! Everything the core needs from storage is the [`Store`] trait; `store::memory`
//! is a reference implementation suitable for tests and as a fallback
//! secondary store, and the `postgres` feature adds a `sqlx`-backed one.

mod cache;
mod circuit_breaker;
mod clock;
mod config;
mod coordinator;
mod error;
mod fallback;
mod observability;
mod period;
mod rate_limiter;
mod serde_util;
pub mod store;
mod types;
mod warnings;

pub use cache::{BoundedCache, CacheStats};
pub use circuit_breaker::{Admission, BreakerState, CircuitBreaker};
pub use clock::{Clock, LocalClock};
pub use config::{CacheConfig, CircuitBreakerConfig, CoreConfig, FallbackConfig};
pub use coordinator::{
    CallOptions, ConsumeOptions, ConsumeResult, QuotaCoordinator, QuotaCoordinatorBuilder,
    RefundParams,
};
pub use error::{QuotaError, QuotaExceededInfo, RateLimitExceededInfo, StoreError};
pub use fallback::{FallbackDecision, FallbackPolicy, FallbackSource};
pub use observability::{noop_sink, FallbackOutcome, GlobalMetricSink, MetricSink, NoopMetricSink, SharedMetricSink};
pub use period::compute_period;
pub use rate_limiter::RateLimiter;
pub use store::{ConsumeOutcome, ConsumeRequest, RateLimitRequest, RefundOutcome, RefundRequest, Store, TierChangeRequest};
pub use types::{
    Entitlement, IdempotencyKey, IdempotencyRecord, Period, PeriodType, RateLimitAlgorithm,
    RateLimitPolicy, RateLimitStatus, RefundKey, RefundRecord, RefundReason, Resource,
    SlidingWindowState, TierConfig, TierName, TokenBucketState, Usage, UserId,
};
pub use warnings::{NoopWarningHandler, WarningHandler};

pub use async_trait::async_trait;
