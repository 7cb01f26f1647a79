//! Property tests for spec.md §8 invariants 1-4 and 6-9, run directly against
//! `store::memory::MemoryStore`. Invariant 5 (warning ordering) and invariant
//! 10 (breaker transitions) are deterministic and live as `#[tokio::test]`s
//! next to the code they cover (`src/warnings.rs`, `src/circuit_breaker.rs`).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use proptest::prelude::*;
use quota_core::store::memory::MemoryStore;
use quota_core::store::{ConsumeOutcome, ConsumeRequest, RateLimitRequest, RefundOutcome, RefundRequest, Store, TierChangeRequest};
use quota_core::{PeriodType, RateLimitAlgorithm, TierName};

fn period(period_type: PeriodType) -> quota_core::Period {
    let start = Utc::now();
    let end = match period_type {
        PeriodType::Daily => start + chrono::Duration::days(1),
        PeriodType::Monthly => start + chrono::Duration::days(30),
        PeriodType::Forever => start + chrono::Duration::days(365 * 100),
    };
    quota_core::Period { start, end, period_type }
}

fn tokio_rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building a current-thread runtime")
}

fn consume_req(
    user_id: &str,
    resource: &str,
    amount: u64,
    period: quota_core::Period,
    limit: Option<u64>,
    idempotency_key: Option<&str>,
) -> ConsumeRequest {
    ConsumeRequest {
        user_id: user_id.into(),
        resource: resource.into(),
        amount,
        period,
        limit,
        tier: TierName::from("free"),
        idempotency_key: idempotency_key.map(Into::into),
        now: Utc::now(),
    }
}

proptest! {
    /// Invariant 1: distinct-keyed consumes summing to S <= limit leave
    /// final used == S.
    #[test]
    fn invariant1_distinct_keys_sum_to_used(
        amounts in prop::collection::vec(1_u64..=20, 1..15),
    ) {
        let total: u64 = amounts.iter().sum();
        let limit = total + 5; // always admits every step
        let rt = tokio_rt();
        rt.block_on(async {
            let store = MemoryStore::new();
            let p = period(PeriodType::Monthly);
            for (i, amount) in amounts.iter().enumerate() {
                let key = format!("k{i}");
                let outcome = store
                    .consume_quota(consume_req("u1", "api_calls", *amount, p, Some(limit), Some(&key)))
                    .await
                    .expect("store call");
                prop_assert!(matches!(outcome, ConsumeOutcome::Ok { .. }));
            }
            let usage = store
                .get_usage(&"u1".into(), &"api_calls".into(), &p)
                .await
                .expect("store call")
                .expect("usage row exists");
            prop_assert_eq!(usage.used, total);
            Ok(())
        })?;
    }

    /// Invariant 2: replays of the same idempotency key increment usage
    /// exactly once and every replay reports the same new_used.
    #[test]
    fn invariant2_same_key_replays_increment_once(
        amount in 1_u64..=50,
        replays in 1_usize..8,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = MemoryStore::new();
            let p = period(PeriodType::Monthly);
            let first = store
                .consume_quota(consume_req("u1", "api_calls", amount, p, Some(1000), Some("k1")))
                .await
                .expect("store call");
            let first_used = match first {
                ConsumeOutcome::Ok { new_used } => new_used,
                other => {
                    prop_assert!(false, "first call with a fresh key must succeed, got {other:?}");
                    amount
                }
            };
            for _ in 0..replays {
                let replay = store
                    .consume_quota(consume_req("u1", "api_calls", amount, p, Some(1000), Some("k1")))
                    .await
                    .expect("store call");
                match replay {
                    ConsumeOutcome::IdempotentReplay { new_used } => {
                        prop_assert_eq!(new_used, first_used);
                    }
                    other => prop_assert!(false, "expected a replay, got {other:?}"),
                }
            }
            let usage = store
                .get_usage(&"u1".into(), &"api_calls".into(), &p)
                .await
                .expect("store call")
                .expect("usage row exists");
            prop_assert_eq!(usage.used, amount);
            Ok(())
        })?;
    }

    /// Invariant 3: refund with a fresh key reduces used by min(amount, used);
    /// replay with the same key is a no-op.
    #[test]
    fn invariant3_refund_reduces_by_min_amount_used(
        consumed in 0_u64..=200,
        refund_amount in 0_u64..=300,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = MemoryStore::new();
            let p = period(PeriodType::Monthly);
            if consumed > 0 {
                store
                    .consume_quota(consume_req("u1", "api_calls", consumed, p, Some(1_000_000), None))
                    .await
                    .expect("store call");
            }
            let refund_request = |now| RefundRequest {
                user_id: "u1".into(),
                resource: "api_calls".into(),
                amount: refund_amount,
                period: p,
                refund_key: "r1".into(),
                reason: "prop".into(),
                now,
            };
            let now = Utc::now();
            let outcome = store.refund_quota(refund_request(now)).await.expect("store call");
            let expected = consumed.saturating_sub(refund_amount.min(consumed));
            match outcome {
                RefundOutcome::Ok { new_used } => prop_assert_eq!(new_used, expected),
                RefundOutcome::IdempotentReplay => prop_assert!(false, "first refund must not replay"),
            }

            let replay = store.refund_quota(refund_request(Utc::now())).await.expect("store call");
            prop_assert_eq!(replay, RefundOutcome::IdempotentReplay);
            let usage = store
                .get_usage(&"u1".into(), &"api_calls".into(), &p)
                .await
                .expect("store call")
                .expect("usage row exists");
            prop_assert_eq!(usage.used, expected, "a replayed refund must not double-apply");
            Ok(())
        })?;
    }

    /// Invariant 4: tier change from (used, old_limit) to new_limit lands on
    /// floor(f*new_limit) or ceil(f*new_limit), f = used/old_limit. Mirrors
    /// `QuotaCoordinator::apply_tier_change`'s rounding without routing
    /// through the coordinator itself.
    #[test]
    fn invariant4_tier_change_proration_rounds_between_floor_and_ceil(
        used in 0_u64..=10_000,
        old_limit in 1_u64..=10_000,
        new_limit in 1_u64..=10_000,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = MemoryStore::new();
            let p = period(PeriodType::Monthly);
            store
                .set_usage(
                    &"u1".into(),
                    &"api_calls".into(),
                    &p,
                    quota_core::Usage { used, limit: Some(old_limit), tier: TierName::from("free"), updated_at: Utc::now() },
                )
                .await
                .expect("store call");

            let fraction = used as f64 / old_limit as f64;
            let new_used = (fraction * new_limit as f64).round() as u64;

            store
                .apply_tier_change(TierChangeRequest {
                    user_id: "u1".into(),
                    resource: "api_calls".into(),
                    period: p,
                    new_tier: TierName::from("pro"),
                    new_limit: Some(new_limit),
                    new_used,
                })
                .await
                .expect("store call");

            let usage = store
                .get_usage(&"u1".into(), &"api_calls".into(), &p)
                .await
                .expect("store call")
                .expect("usage row exists");

            let exact = fraction * new_limit as f64;
            let floor = exact.floor() as u64;
            let ceil = exact.ceil() as u64;
            prop_assert!(
                usage.used == floor || usage.used == ceil,
                "new_used {} not in {{{}, {}}}", usage.used, floor, ceil
            );
            Ok(())
        })?;
    }

    /// Invariant 6: N concurrent consumes of amount A against limit L with no
    /// rate limit: successful count = min(N, floor(L/A)); final used =
    /// successful * A.
    #[test]
    fn invariant6_concurrent_consumes_saturate_at_limit(
        n in 1_usize..25,
        amount in 1_u64..=10,
        limit in 1_u64..=100,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let p = period(PeriodType::Monthly);
            let mut set = tokio::task::JoinSet::new();
            for _ in 0..n {
                let store = store.clone();
                set.spawn(async move {
                    store
                        .consume_quota(consume_req("u1", "api_calls", amount, p, Some(limit), None))
                        .await
                        .expect("store call")
                });
            }
            let mut successful = 0_u64;
            while let Some(result) = set.join_next().await {
                if matches!(result.expect("task completes"), ConsumeOutcome::Ok { .. }) {
                    successful += 1;
                }
            }
            let expected_successful = (n as u64).min(limit / amount);
            prop_assert_eq!(successful, expected_successful);

            let usage = store
                .get_usage(&"u1".into(), &"api_calls".into(), &p)
                .await
                .expect("store call")
                .expect("usage row exists");
            prop_assert_eq!(usage.used, successful * amount);
            Ok(())
        })?;
    }

    /// Invariant 7: N concurrent consumes sharing one idempotency key: exactly
    /// one mutation commits, the rest are replays, and used increases by A
    /// exactly once.
    #[test]
    fn invariant7_concurrent_same_key_commits_once(
        n in 2_usize..25,
        amount in 1_u64..=50,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let p = period(PeriodType::Monthly);
            let mut set = tokio::task::JoinSet::new();
            for _ in 0..n {
                let store = store.clone();
                set.spawn(async move {
                    store
                        .consume_quota(consume_req("u1", "api_calls", amount, p, Some(1_000_000), Some("shared")))
                        .await
                        .expect("store call")
                });
            }
            let mut commits = 0_u64;
            let mut replays = 0_u64;
            while let Some(result) = set.join_next().await {
                match result.expect("task completes") {
                    ConsumeOutcome::Ok { .. } => commits += 1,
                    ConsumeOutcome::IdempotentReplay { .. } => replays += 1,
                    other => prop_assert!(false, "unexpected outcome: {other:?}"),
                }
            }
            prop_assert_eq!(commits, 1);
            prop_assert_eq!(replays, n as u64 - 1);

            let usage = store
                .get_usage(&"u1".into(), &"api_calls".into(), &p)
                .await
                .expect("store call")
                .expect("usage row exists");
            prop_assert_eq!(usage.used, amount);
            Ok(())
        })?;
    }

    /// Invariant 8: token bucket fully refills after quiescence >= window.
    #[test]
    fn invariant8_token_bucket_refills_after_quiescence(
        burst in 1_u64..=50,
        rate in 1_u64..=50,
        window_secs in 1_u64..=10,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = MemoryStore::new();
            let now = Utc::now();
            let window = StdDuration::from_secs(window_secs);

            // Drain the bucket.
            for _ in 0..burst {
                store
                    .check_rate_limit(RateLimitRequest {
                        user_id: "u1".into(),
                        resource: "api_calls".into(),
                        algorithm: RateLimitAlgorithm::TokenBucket,
                        cost: 1,
                        rate,
                        window,
                        burst,
                        now,
                    })
                    .await
                    .expect("store call");
            }

            let later = now + chrono::Duration::from_std(window).expect("window fits in chrono::Duration") * 2;
            let status = store
                .check_rate_limit(RateLimitRequest {
                    user_id: "u1".into(),
                    resource: "api_calls".into(),
                    algorithm: RateLimitAlgorithm::TokenBucket,
                    cost: burst,
                    rate,
                    window,
                    burst,
                    now: later,
                })
                .await
                .expect("store call");
            prop_assert!(status.allowed, "a full burst must be available after quiescence >= window");
            Ok(())
        })?;
    }

    /// Invariant 9: sliding window never admits more than `rate` requests
    /// inside any interval of length `window`.
    #[test]
    fn invariant9_sliding_window_never_exceeds_rate_per_window(
        rate in 1_u64..=20,
        attempts in 1_usize..60,
        window_secs in 1_u64..=5,
    ) {
        let rt = tokio_rt();
        rt.block_on(async {
            let store = MemoryStore::new();
            let now = Utc::now();
            let window = StdDuration::from_secs(window_secs);
            let mut admitted_at = Vec::new();

            for i in 0..attempts {
                let t = now + chrono::Duration::milliseconds((i as i64) * 50);
                let status = store
                    .check_rate_limit(RateLimitRequest {
                        user_id: "u1".into(),
                        resource: "api_calls".into(),
                        algorithm: RateLimitAlgorithm::SlidingWindow,
                        cost: 1,
                        rate,
                        window,
                        burst: rate,
                        now: t,
                    })
                    .await
                    .expect("store call");
                if status.allowed {
                    admitted_at.push(t);
                }
            }

            let window_chrono = chrono::Duration::from_std(window).expect("window fits in chrono::Duration");
            for anchor in &admitted_at {
                let in_window = admitted_at
                    .iter()
                    .filter(|t| **t >= *anchor - window_chrono && **t <= *anchor)
                    .count() as u64;
                prop_assert!(in_window <= rate, "{} admissions fell inside one window (rate {})", in_window, rate);
            }
            Ok(())
        })?;
    }
}
