//! Authoritative time source. Period boundaries, rate-limit windows and
//! idempotency TTLs must derive from the store-provided clock when available
//! (spec.md §4.2) so that instances whose wall clocks drift don't compute
//! different periods for the same instant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Authoritative clock. Implementations may defer to local time when no
/// server clock is available, but must say so explicitly (`LocalClock`)
/// rather than silently wrapping a store call that could fail.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError>;
}

/// Local wall-clock fallback, used by `Store` implementations with no
/// server-side clock and by tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalClock;

#[async_trait]
impl Clock for LocalClock {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(Utc::now())
    }
}
