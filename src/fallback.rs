//! Fallback chain triggered when the primary store call fails or the circuit
//! is open (spec.md §4.7): cache → secondary store → optimistic allowance.
//! Never applied to refunds (spec.md §7).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::cache::BoundedCache;
use crate::config::FallbackConfig;
use crate::error::{QuotaError, StoreError};
use crate::observability::{FallbackOutcome, SharedMetricSink};
use crate::store::{ConsumeRequest, ConsumeOutcome, Store};
use crate::types::{Period, Resource, UserId};

/// Where a fallback decision's `new_used` came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackSource {
    Cache,
    SecondaryStore,
    OptimisticAllowance,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FallbackDecision {
    pub new_used: u64,
    pub source: FallbackSource,
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct GrantKey {
    user_id: UserId,
    resource: Resource,
    period_key: String,
}

/// Implements the ordered fallback attempt described in spec.md §4.7.
/// Optimistic grants are tracked locally (not in the store) since they exist
/// precisely because the store is unreachable; reconciliation against the
/// authoritative store happens out of process, once it recovers.
pub struct FallbackPolicy {
    config: FallbackConfig,
    cache: Arc<BoundedCache>,
    secondary: Option<Arc<dyn Store>>,
    metrics: SharedMetricSink,
    optimistic_grants: DashMap<GrantKey, u64>,
}

impl FallbackPolicy {
    pub fn new(
        config: FallbackConfig,
        cache: Arc<BoundedCache>,
        secondary: Option<Arc<dyn Store>>,
        metrics: SharedMetricSink,
    ) -> Self {
        Self {
            config,
            cache,
            secondary,
            metrics,
            optimistic_grants: DashMap::new(),
        }
    }

    /// Attempts to serve a consume that failed against the primary store.
    /// Returns the original error, wrapped as `StorageUnavailable`, if every
    /// configured step is skipped or fails.
    pub async fn consume(
        &self,
        request: &ConsumeRequest,
        primary_error: StoreError,
        now: DateTime<Utc>,
    ) -> Result<FallbackDecision, QuotaError> {
        if !self.config.enabled {
            return Err(QuotaError::StorageUnavailable { source: primary_error });
        }

        if self.config.fallback_to_cache {
            if let Some(decision) = self.try_cache(request, now) {
                self.metrics.fallback_activation(FallbackOutcome::Cache);
                return Ok(decision);
            }
        }

        if self.config.secondary_store {
            if let Some(secondary) = &self.secondary {
                match secondary.consume_quota(request.clone()).await {
                    Ok(ConsumeOutcome::Ok { new_used } | ConsumeOutcome::IdempotentReplay { new_used }) => {
                        self.metrics.fallback_activation(FallbackOutcome::SecondaryStore);
                        return Ok(FallbackDecision {
                            new_used,
                            source: FallbackSource::SecondaryStore,
                        });
                    }
                    Ok(ConsumeOutcome::QuotaExceeded { current_used }) => {
                        return Err(QuotaError::QuotaExceeded {
                            info: Box::new(crate::error::QuotaExceededInfo {
                                user_id: request.user_id.clone(),
                                resource: request.resource.clone(),
                                usage: crate::types::Usage {
                                    used: current_used,
                                    limit: request.limit,
                                    tier: request.tier.clone(),
                                    updated_at: now,
                                },
                            }),
                        });
                    }
                    Err(_) => {
                        // Secondary store also down; fall through to the next step.
                    }
                }
            }
        }

        if self.config.optimistic_allowance {
            if let Some(decision) = self.try_optimistic(request)? {
                self.metrics.fallback_activation(FallbackOutcome::OptimisticAllowance);
                return Ok(decision);
            }
        }

        self.metrics.fallback_activation(FallbackOutcome::Exhausted);
        Err(QuotaError::StorageUnavailable { source: primary_error })
    }

    fn try_cache(&self, request: &ConsumeRequest, now: DateTime<Utc>) -> Option<FallbackDecision> {
        let period_key = request.period.period_key();
        let cached = self.cache.get_usage(&request.user_id, &request.resource, &period_key)?;
        let age = now.signed_duration_since(cached.updated_at).to_std().unwrap_or_default();
        if age > self.config.max_staleness {
            return None;
        }
        Some(FallbackDecision {
            new_used: cached.used + request.amount,
            source: FallbackSource::Cache,
        })
    }

    fn try_optimistic(&self, request: &ConsumeRequest) -> Result<Option<FallbackDecision>, QuotaError> {
        let Some(limit) = request.limit else {
            // Unlimited resources have no optimistic bound to police.
            return Ok(Some(FallbackDecision {
                new_used: request.amount,
                source: FallbackSource::OptimisticAllowance,
            }));
        };
        let period_key = request.period.period_key();
        let last_known = self
            .cache
            .get_usage(&request.user_id, &request.resource, &period_key)
            .map_or(0, |u| u.used);

        let key = GrantKey {
            user_id: request.user_id.clone(),
            resource: request.resource.clone(),
            period_key,
        };
        let bound = (limit as f64 * (1.0 + self.config.optimistic_percentage)).floor() as u64;

        let mut entry = self.optimistic_grants.entry(key).or_insert(0);
        let candidate_used = last_known + *entry + request.amount;
        if candidate_used > bound {
            return Err(QuotaError::OptimisticLimitExceeded {
                user_id: request.user_id.clone(),
                resource: request.resource.clone(),
            });
        }
        *entry += request.amount;
        Ok(Some(FallbackDecision {
            new_used: candidate_used,
            source: FallbackSource::OptimisticAllowance,
        }))
    }

    /// Cache-only fallback for reads (`get_quota`): no optimistic allowance,
    /// since fabricating a read result would misreport actual usage rather
    /// than merely risk over-admitting one more consume.
    pub fn read_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
        now: DateTime<Utc>,
    ) -> Result<crate::types::Usage, QuotaError> {
        if !self.config.enabled || !self.config.fallback_to_cache {
            return Err(QuotaError::FallbackUnavailable);
        }
        let period_key = period.period_key();
        let cached = self
            .cache
            .get_usage(user_id, resource, &period_key)
            .ok_or(QuotaError::FallbackUnavailable)?;
        let age = now.signed_duration_since(cached.updated_at).to_std().unwrap_or_default();
        if age > self.config.max_staleness {
            return Err(QuotaError::StaleCache {
                age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                max_staleness_ms: u64::try_from(self.config.max_staleness.as_millis()).unwrap_or(u64::MAX),
            });
        }
        self.metrics.fallback_activation(FallbackOutcome::Cache);
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_cache;
    use crate::observability::noop_sink;
    use crate::types::{Period, PeriodType, TierName, Usage};
    use std::time::Duration as StdDuration;

    fn period(now: DateTime<Utc>) -> Period {
        Period {
            start: now - chrono::Duration::days(1),
            end: now + chrono::Duration::days(29),
            period_type: PeriodType::Monthly,
        }
    }

    fn consume_request(now: DateTime<Utc>, amount: u64, limit: Option<u64>) -> ConsumeRequest {
        ConsumeRequest {
            user_id: "u1".into(),
            resource: "api_calls".into(),
            amount,
            period: period(now),
            limit,
            tier: TierName::from("free"),
            idempotency_key: None,
            now,
        }
    }

    #[tokio::test]
    async fn falls_back_to_fresh_cache_entry() {
        let now = Utc::now();
        let cache = Arc::new(test_cache(10, StdDuration::from_secs(60)));
        cache.put_usage(
            &"u1".into(),
            &"api_calls".into(),
            &period(now).period_key(),
            Usage {
                used: 40,
                limit: Some(100),
                tier: "free".into(),
                updated_at: now,
            },
        );
        let config = FallbackConfig {
            enabled: true,
            fallback_to_cache: true,
            optimistic_allowance: false,
            optimistic_percentage: 0.1,
            max_staleness: StdDuration::from_secs(30),
            secondary_store: false,
        };
        let policy = FallbackPolicy::new(config, cache, None, noop_sink());
        let decision = policy
            .consume(&consume_request(now, 5, Some(100)), StoreError::Unavailable { message: "down".into() }, now)
            .await
            .expect("cache fallback succeeds");
        assert_eq!(decision, FallbackDecision { new_used: 45, source: FallbackSource::Cache });
    }

    #[tokio::test]
    async fn stale_cache_entry_is_skipped() {
        let now = Utc::now();
        let cache = Arc::new(test_cache(10, StdDuration::from_secs(60)));
        cache.put_usage(
            &"u1".into(),
            &"api_calls".into(),
            &period(now).period_key(),
            Usage {
                used: 40,
                limit: Some(100),
                tier: "free".into(),
                updated_at: now - chrono::Duration::seconds(120),
            },
        );
        let config = FallbackConfig {
            enabled: true,
            fallback_to_cache: true,
            optimistic_allowance: false,
            optimistic_percentage: 0.1,
            max_staleness: StdDuration::from_secs(30),
            secondary_store: false,
        };
        let policy = FallbackPolicy::new(config, cache, None, noop_sink());
        let err = policy
            .consume(&consume_request(now, 5, Some(100)), StoreError::Unavailable { message: "down".into() }, now)
            .await
            .expect_err("stale cache must not serve a decision");
        assert!(matches!(err, QuotaError::StorageUnavailable { .. }));
    }

    #[tokio::test]
    async fn optimistic_allowance_caps_at_configured_percentage() {
        let now = Utc::now();
        let cache = Arc::new(test_cache(10, StdDuration::from_secs(60)));
        cache.put_usage(
            &"u1".into(),
            &"api_calls".into(),
            &period(now).period_key(),
            Usage {
                used: 95,
                limit: Some(100),
                tier: "free".into(),
                updated_at: now,
            },
        );
        let config = FallbackConfig {
            enabled: true,
            fallback_to_cache: false,
            optimistic_allowance: true,
            optimistic_percentage: 0.1,
            max_staleness: StdDuration::from_secs(30),
            secondary_store: false,
        };
        let policy = FallbackPolicy::new(config, cache, None, noop_sink());
        let ok = policy
            .consume(&consume_request(now, 5, Some(100)), StoreError::Unavailable { message: "down".into() }, now)
            .await
            .expect("within the 10% optimistic band");
        assert_eq!(ok.new_used, 100);

        let err = policy
            .consume(&consume_request(now, 10, Some(100)), StoreError::Unavailable { message: "down".into() }, now)
            .await
            .expect_err("exceeds the 10% optimistic band");
        assert!(matches!(err, QuotaError::OptimisticLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn disabled_fallback_propagates_original_error() {
        let now = Utc::now();
        let cache = Arc::new(test_cache(10, StdDuration::from_secs(60)));
        let config = FallbackConfig {
            enabled: false,
            fallback_to_cache: true,
            optimistic_allowance: true,
            optimistic_percentage: 0.1,
            max_staleness: StdDuration::from_secs(30),
            secondary_store: false,
        };
        let policy = FallbackPolicy::new(config, cache, None, noop_sink());
        let err = policy
            .consume(&consume_request(now, 5, Some(100)), StoreError::Unavailable { message: "down".into() }, now)
            .await
            .expect_err("disabled fallback never serves a decision");
        assert!(matches!(err, QuotaError::StorageUnavailable { .. }));
    }
}
