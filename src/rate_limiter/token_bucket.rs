//! Token bucket admission math (spec.md §4.6). Pure and state-shaped so every
//! `Store` backend applies the same formula instead of re-deriving it.

use chrono::{DateTime, Utc};

use crate::types::{RateLimitStatus, TokenBucketState};

/// Applies one token-bucket check at `now` against `state` (absent on first
/// use, seeded full). When `mutate` is `false` the refill/deduction is
/// computed but not returned as a new state (`Store::peek_rate_limit`).
pub fn apply(
    state: Option<TokenBucketState>,
    cost: u64,
    rate: u64,
    window: std::time::Duration,
    burst: u64,
    now: DateTime<Utc>,
    mutate: bool,
) -> (RateLimitStatus, Option<TokenBucketState>) {
    let window_secs = window.as_secs_f64().max(f64::EPSILON);
    let rate_per_sec = rate as f64 / window_secs;
    let (tokens_before, last_refill) = match state {
        Some(s) => (s.tokens, s.last_refill),
        None => (burst as f64, now),
    };
    let elapsed_secs = (now - last_refill).num_milliseconds().max(0) as f64 / 1000.0;
    let refilled = (tokens_before + elapsed_secs * rate_per_sec).min(burst as f64);

    let cost = cost as f64;
    let allowed = refilled >= cost;
    let tokens_after = if allowed { refilled - cost } else { refilled };
    let remaining = tokens_after.floor().max(0.0) as u64;
    let deficit = (burst as f64 - tokens_after).max(0.0);
    let seconds_to_full = if rate_per_sec > 0.0 { deficit / rate_per_sec } else { 0.0 };
    let reset_time = now + chrono::Duration::milliseconds((seconds_to_full * 1000.0) as i64);

    let status = RateLimitStatus {
        allowed,
        limit: burst,
        remaining,
        reset_time,
    };
    let next_state = mutate.then_some(TokenBucketState {
        tokens: tokens_after,
        last_refill: now,
    });
    (status, next_state)
}
