//! Sliding window admission math (spec.md §4.6).

use chrono::{DateTime, Utc};

use crate::types::{RateLimitStatus, SlidingWindowState};

/// Applies one sliding-window check at `now`. Entries older than `now - window`
/// are dropped before counting. When `mutate` is `false`, `now` is not
/// appended to the returned state even if it would be admitted
/// (`Store::peek_rate_limit`).
pub fn apply(
    state: Option<&SlidingWindowState>,
    rate: u64,
    window: std::time::Duration,
    now: DateTime<Utc>,
    mutate: bool,
) -> (RateLimitStatus, Option<SlidingWindowState>) {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    let cutoff = now - window;
    let mut timestamps: Vec<DateTime<Utc>> = state
        .map(|s| s.timestamps.iter().copied().filter(|t| *t > cutoff).collect())
        .unwrap_or_default();

    let count = timestamps.len() as u64;
    let allowed = count < rate;
    let oldest = timestamps.first().copied();
    if allowed && mutate {
        timestamps.push(now);
    }
    let remaining = rate.saturating_sub(count + u64::from(allowed));
    let reset_time = oldest.map_or(now, |oldest| oldest + window);

    let status = RateLimitStatus {
        allowed,
        limit: rate,
        remaining,
        reset_time,
    };
    let next_state = mutate.then_some(SlidingWindowState { timestamps });
    (status, next_state)
}
