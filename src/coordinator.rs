//! Public façade (spec.md §4.9): the one entry point embedding applications
//! call. Composes every other module behind the consume/refund/tier-change
//! algorithms described there. The coordinator itself is stateless across
//! calls — all durable state lives in the store, per spec.md §5.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache::BoundedCache;
use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::clock::{Clock, LocalClock};
use crate::config::CoreConfig;
use crate::error::{QuotaError, QuotaExceededInfo, RateLimitExceededInfo, StoreError};
use crate::fallback::FallbackPolicy;
use crate::observability::SharedMetricSink;
use crate::period::compute_period;
use crate::rate_limiter::RateLimiter;
use crate::store::{ConsumeOutcome, ConsumeRequest, RefundOutcome, RefundRequest, Store, TierChangeRequest};
use crate::types::{
    Entitlement, IdempotencyKey, Period, PeriodType, RefundKey, RefundReason, Resource, TierName,
    Usage, UserId,
};
use crate::warnings::{self, WarningHandler};

/// Options recognized on `consume` (spec.md §4.9).
#[derive(Clone, Debug, Default)]
pub struct ConsumeOptions {
    pub idempotency_key: Option<IdempotencyKey>,
    pub dry_run: bool,
}

/// Result of `consume_with_result`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumeResult {
    pub new_used: u64,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub percentage: Option<f64>,
}

/// Parameters for `refund`.
#[derive(Clone, Debug)]
pub struct RefundParams {
    pub user_id: UserId,
    pub resource: Resource,
    pub amount: u64,
    pub period: Option<Period>,
    pub refund_key: RefundKey,
    pub reason: RefundReason,
}

/// Per-call execution bounds: cooperative cancellation plus a deadline
/// applied to each individual store round-trip (spec.md §5).
#[derive(Clone, Default)]
pub struct CallOptions {
    pub cancellation: CancellationToken,
    pub deadline: Option<Duration>,
}

pub struct QuotaCoordinatorBuilder {
    config: CoreConfig,
    store: Arc<dyn Store>,
    secondary_store: Option<Arc<dyn Store>>,
    cache: Option<Arc<BoundedCache>>,
    warning_handler: Option<Arc<dyn WarningHandler>>,
    metrics: Option<SharedMetricSink>,
    clock: Option<Arc<dyn Clock>>,
}

impl QuotaCoordinatorBuilder {
    pub fn new(config: CoreConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            secondary_store: None,
            cache: None,
            warning_handler: None,
            metrics: None,
            clock: None,
        }
    }

    pub fn secondary_store(mut self, store: Arc<dyn Store>) -> Self {
        self.secondary_store = Some(store);
        self
    }

    pub fn warning_handler(mut self, handler: Arc<dyn WarningHandler>) -> Self {
        self.warning_handler = Some(handler);
        self
    }

    pub fn metrics(mut self, sink: SharedMetricSink) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Local-clock fallback used when the store's own `now()` is unavailable
    /// (spec.md §4.2). Defaults to `LocalClock`; overridable so tests can
    /// supply a deterministic clock instead of wall-clock time.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<QuotaCoordinator, QuotaError> {
        self.config.validate()?;
        let cache = self.cache.unwrap_or_else(|| Arc::new(BoundedCache::new(&self.config.cache)));
        let metrics = self.metrics.unwrap_or_else(crate::observability::noop_sink);
        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let rate_limiter = RateLimiter::new(self.store.clone());
        let fallback = FallbackPolicy::new(
            self.config.fallback.clone(),
            cache.clone(),
            self.secondary_store,
            metrics.clone(),
        );
        Ok(QuotaCoordinator {
            config: Arc::new(self.config),
            store: self.store,
            cache,
            breaker,
            rate_limiter,
            fallback,
            warning_handler: self.warning_handler.unwrap_or_else(|| Arc::new(crate::warnings::NoopWarningHandler)),
            metrics,
            clock: self.clock.unwrap_or_else(|| Arc::new(LocalClock)),
        })
    }
}

/// The quota enforcement façade. Cheap to clone (every field is an `Arc`-like
/// handle); typically held once per process behind an `Arc<QuotaCoordinator>`.
pub struct QuotaCoordinator {
    config: Arc<CoreConfig>,
    store: Arc<dyn Store>,
    cache: Arc<BoundedCache>,
    breaker: Arc<CircuitBreaker>,
    rate_limiter: RateLimiter,
    fallback: FallbackPolicy,
    warning_handler: Arc<dyn WarningHandler>,
    metrics: SharedMetricSink,
    clock: Arc<dyn Clock>,
}

impl QuotaCoordinator {
    pub fn builder(config: CoreConfig, store: Arc<dyn Store>) -> QuotaCoordinatorBuilder {
        QuotaCoordinatorBuilder::new(config, store)
    }

    /// Wraps one store round-trip with the circuit breaker, an optional
    /// per-call deadline, and latency/transition metrics. Not applied to
    /// cooperative cancellation checks, which happen at the call site so
    /// "cancel before commit leaves state unchanged" holds exactly.
    async fn guarded<T, Fut>(
        &self,
        operation: &'static str,
        options: &CallOptions,
        call: impl FnOnce() -> Fut,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let before = self.breaker.state();
        let result = match self.breaker.admit() {
            Admission::ShortCircuited => Err(StoreError::Unavailable {
                message: format!("circuit breaker open for {operation}"),
            }),
            Admission::Allowed | Admission::Probe => {
                let start = Instant::now();
                let outcome = match options.deadline {
                    Some(deadline) => match tokio::time::timeout(deadline, call()).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Timeout {
                            elapsed_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        }),
                    },
                    None => call().await,
                };
                self.metrics.store_latency(operation, start.elapsed());
                match &outcome {
                    Ok(_) => self.breaker.record_success(),
                    Err(_) => self.breaker.record_failure(),
                }
                outcome
            }
        };
        let after = self.breaker.state();
        if before != after {
            self.metrics.circuit_transition(before, after);
        }
        result
    }

    fn check_cancelled(cancellation: &CancellationToken) -> Result<(), QuotaError> {
        if cancellation.is_cancelled() {
            return Err(QuotaError::Cancelled);
        }
        Ok(())
    }

    async fn resolve_entitlement_and_tier(
        &self,
        user_id: &UserId,
        options: &CallOptions,
    ) -> Result<(DateTime<Utc>, TierName), QuotaError> {
        if let Some(entitlement) = self.cache.get_entitlement(user_id) {
            return Ok((entitlement.subscription_start_date, entitlement.tier));
        }
        match self
            .guarded("get_entitlement", options, || self.store.get_entitlement(user_id))
            .await
        {
            Ok(Some(entitlement)) => {
                self.cache.put_entitlement(entitlement.clone());
                Ok((entitlement.subscription_start_date, entitlement.tier))
            }
            Ok(None) => Ok((crate::period::epoch(), TierName(self.config.default_tier.clone()))),
            Err(source) => Err(QuotaError::from(source)),
        }
    }

    /// `consume(user, resource, amount, period_type, options) -> new_used`.
    pub async fn consume(
        &self,
        user_id: &UserId,
        resource: &Resource,
        amount: u64,
        period_type: PeriodType,
        opts: ConsumeOptions,
        call: CallOptions,
    ) -> Result<u64, QuotaError> {
        self.consume_with_result(user_id, resource, amount, period_type, opts, call)
            .await
            .map(|r| r.new_used)
    }

    /// `consume_with_result` — the full consume algorithm (spec.md §4.9 steps 1-9).
    pub async fn consume_with_result(
        &self,
        user_id: &UserId,
        resource: &Resource,
        amount: u64,
        period_type: PeriodType,
        opts: ConsumeOptions,
        call: CallOptions,
    ) -> Result<ConsumeResult, QuotaError> {
        Self::check_cancelled(&call.cancellation)?;

        let now = self.authoritative_now(&call).await?;
        let (subscription_start, tier_name) = self.resolve_entitlement_and_tier(user_id, &call).await?;
        let tier_config = self
            .config
            .tiers
            .get(&tier_name.0)
            .ok_or_else(|| QuotaError::InvalidTier { tier: tier_name.clone() })?;

        let period = compute_period(subscription_start, now, period_type);
        let limit = tier_config.quota_for(resource, period_type);

        if amount == 0 {
            let usage = self.read_usage_best_effort(user_id, resource, &period, &call).await;
            return Ok(Self::result_from_usage(&usage, limit));
        }

        if let Some(policy) = tier_config.rate_limit_for(resource) {
            self.enforce_rate_limit(user_id, resource, policy, amount, now, &call).await?;
        }

        let before_usage = self.read_usage_best_effort(user_id, resource, &period, &call).await;

        if opts.dry_run {
            let would_be = before_usage.used + amount;
            if let Some(limit) = limit {
                if would_be > limit {
                    self.metrics.consume(&tier_name.0, &resource.0, false);
                }
            }
            return Ok(ConsumeResult {
                new_used: before_usage.used,
                limit,
                remaining: limit.map(|l| l.saturating_sub(before_usage.used)),
                percentage: limit.map(|l| before_usage.used as f64 / l as f64),
            });
        }

        Self::check_cancelled(&call.cancellation)?;

        let idempotency_key = opts.idempotency_key;
        let request = ConsumeRequest {
            user_id: user_id.clone(),
            resource: resource.clone(),
            amount,
            period,
            limit,
            tier: tier_name.clone(),
            idempotency_key: idempotency_key.clone(),
            now,
        };

        let outcome = match self.guarded("consume_quota", &call, || self.store.consume_quota(request.clone())).await {
            Ok(outcome) => outcome,
            Err(source) => {
                let decision = self.fallback.consume(&request, source, now).await?;
                self.metrics.consume(&tier_name.0, &resource.0, true);
                return Ok(ConsumeResult {
                    new_used: decision.new_used,
                    limit,
                    remaining: limit.map(|l| l.saturating_sub(decision.new_used)),
                    percentage: limit.map(|l| decision.new_used as f64 / l as f64),
                });
            }
        };

        match outcome {
            ConsumeOutcome::Ok { new_used } => {
                self.metrics.consume(&tier_name.0, &resource.0, true);
                let usage = Usage {
                    used: new_used,
                    limit,
                    tier: tier_name.clone(),
                    updated_at: now,
                };
                self.cache.put_usage(user_id, resource, &period.period_key(), usage.clone());
                if let Some(limit) = limit {
                    let thresholds = tier_config.thresholds_for(resource);
                    warnings::dispatch(self.warning_handler.as_ref(), &usage, thresholds, before_usage.used, limit);
                }
                Ok(Self::result_from_usage(&usage, limit))
            }
            ConsumeOutcome::IdempotentReplay { new_used } => {
                self.metrics.consume(&tier_name.0, &resource.0, true);
                let usage = Usage {
                    used: new_used,
                    limit,
                    tier: tier_name,
                    updated_at: now,
                };
                Ok(Self::result_from_usage(&usage, limit))
            }
            ConsumeOutcome::QuotaExceeded { current_used } => {
                if period_type != PeriodType::Forever {
                    if let Some(result) = self
                        .try_forever_credit(user_id, resource, amount, &tier_name, idempotency_key, now, &call)
                        .await?
                    {
                        self.metrics.consume(&tier_name.0, &resource.0, true);
                        return Ok(result);
                    }
                }
                self.metrics.consume(&tier_name.0, &resource.0, false);
                Err(QuotaError::QuotaExceeded {
                    info: Box::new(QuotaExceededInfo {
                        user_id: user_id.clone(),
                        resource: resource.clone(),
                        usage: Usage {
                            used: current_used,
                            limit,
                            tier: tier_name,
                            updated_at: now,
                        },
                    }),
                })
            }
        }
    }

    /// Draws from the non-expiring grant pool (spec.md §9 Open Question:
    /// periodic limit is checked first; this is only reached once it has
    /// already denied).
    async fn try_forever_credit(
        &self,
        user_id: &UserId,
        resource: &Resource,
        amount: u64,
        tier_name: &TierName,
        idempotency_key: Option<IdempotencyKey>,
        now: DateTime<Utc>,
        call: &CallOptions,
    ) -> Result<Option<ConsumeResult>, QuotaError> {
        let forever = compute_period(crate::period::epoch(), now, PeriodType::Forever);
        let credit = self.read_usage_best_effort(user_id, resource, &forever, call).await;
        let Some(credit_limit) = credit.limit else {
            return Ok(None);
        };
        if credit_limit == 0 {
            return Ok(None);
        }

        let request = ConsumeRequest {
            user_id: user_id.clone(),
            resource: resource.clone(),
            amount,
            period: forever,
            limit: Some(credit_limit),
            tier: tier_name.clone(),
            idempotency_key,
            now,
        };
        let outcome = self.guarded("consume_quota", call, || self.store.consume_quota(request.clone())).await?;
        match outcome {
            ConsumeOutcome::Ok { new_used } | ConsumeOutcome::IdempotentReplay { new_used } => {
                self.cache.put_usage(
                    user_id,
                    resource,
                    &forever.period_key(),
                    Usage { used: new_used, limit: Some(credit_limit), tier: tier_name.clone(), updated_at: now },
                );
                Ok(Some(ConsumeResult {
                    new_used,
                    limit: Some(credit_limit),
                    remaining: Some(credit_limit.saturating_sub(new_used)),
                    percentage: Some(new_used as f64 / credit_limit as f64),
                }))
            }
            ConsumeOutcome::QuotaExceeded { .. } => Ok(None),
        }
    }

    async fn enforce_rate_limit(
        &self,
        user_id: &UserId,
        resource: &Resource,
        policy: &crate::types::RateLimitPolicy,
        amount: u64,
        now: DateTime<Utc>,
        call: &CallOptions,
    ) -> Result<(), QuotaError> {
        let start = Instant::now();
        let status = match self
            .guarded("check_rate_limit", call, || self.rate_limiter.check(user_id, resource, policy, amount, now))
            .await
        {
            Ok(status) => status,
            Err(_) => {
                // No fallback strategy models a rate-limit decision (spec.md
                // §4.7 is specified around consume_quota); fail open rather
                // than block every request while the store recovers.
                self.metrics.rate_limit_check(true, start.elapsed());
                return Ok(());
            }
        };
        self.metrics.rate_limit_check(status.allowed, start.elapsed());
        if !status.allowed {
            return Err(QuotaError::RateLimitExceeded {
                info: RateLimitExceededInfo::from((status, now)),
            });
        }
        Ok(())
    }

    /// Prefers the store's own clock (spec.md §4.2); falls back to the
    /// coordinator's injected `Clock` only when the store round-trip fails,
    /// so drifting instance clocks never override an available server clock.
    async fn authoritative_now(&self, call: &CallOptions) -> Result<DateTime<Utc>, QuotaError> {
        match self.guarded("now", call, || self.store.now()).await {
            Ok(now) => Ok(now),
            Err(_) => self.clock.now().await.map_err(QuotaError::from),
        }
    }

    async fn read_usage_best_effort(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
        call: &CallOptions,
    ) -> Usage {
        let period_key = period.period_key();
        if let Some(usage) = self.cache.get_usage(user_id, resource, &period_key) {
            return usage;
        }
        match self
            .guarded("get_usage", call, || self.store.get_usage(user_id, resource, period))
            .await
        {
            Ok(Some(usage)) => usage,
            _ => Usage {
                used: 0,
                limit: None,
                tier: TierName::default(),
                updated_at: period.start,
            },
        }
    }

    fn result_from_usage(usage: &Usage, limit: Option<u64>) -> ConsumeResult {
        ConsumeResult {
            new_used: usage.used,
            limit,
            remaining: limit.map(|l| l.saturating_sub(usage.used)),
            percentage: limit.map(|l| usage.used as f64 / l.max(1) as f64),
        }
    }

    /// `get_quota(user, resource, period_type) -> Usage`.
    pub async fn get_quota(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period_type: PeriodType,
        call: CallOptions,
    ) -> Result<Usage, QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        let now = self.authoritative_now(&call).await?;
        let (subscription_start, tier_name) = self.resolve_entitlement_and_tier(user_id, &call).await?;
        let tier_config = self
            .config
            .tiers
            .get(&tier_name.0)
            .ok_or_else(|| QuotaError::InvalidTier { tier: tier_name.clone() })?;
        let period = compute_period(subscription_start, now, period_type);
        let limit = tier_config.quota_for(resource, period_type);

        let period_key = period.period_key();
        if let Some(usage) = self.cache.get_usage(user_id, resource, &period_key) {
            return Ok(usage);
        }
        match self
            .guarded("get_usage", &call, || self.store.get_usage(user_id, resource, &period))
            .await
        {
            Ok(Some(usage)) => Ok(usage),
            Ok(None) => Ok(Usage {
                used: 0,
                limit,
                tier: tier_name,
                updated_at: now,
            }),
            Err(source) => self.fallback.read_usage(user_id, resource, &period, now).map_err(|err| {
                if matches!(err, QuotaError::FallbackUnavailable) {
                    QuotaError::from(source)
                } else {
                    err
                }
            }),
        }
    }

    /// `refund(RefundRequest) -> ok`. Never falls back (spec.md §7): a
    /// storage failure here propagates directly.
    pub async fn refund(&self, params: RefundParams, call: CallOptions) -> Result<u64, QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        if params.amount == 0 {
            return Err(QuotaError::InvalidAmount { amount: 0 });
        }
        let now = self.authoritative_now(&call).await?;
        let period = match params.period {
            Some(period) => period,
            None => {
                let (subscription_start, _) = self.resolve_entitlement_and_tier(&params.user_id, &call).await?;
                compute_period(subscription_start, now, PeriodType::Monthly)
            }
        };

        Self::check_cancelled(&call.cancellation)?;
        let request = RefundRequest {
            user_id: params.user_id.clone(),
            resource: params.resource.clone(),
            amount: params.amount,
            period,
            refund_key: params.refund_key,
            reason: params.reason,
            now,
        };
        let outcome = self
            .guarded("refund_quota", &call, || self.store.refund_quota(request.clone()))
            .await?;
        match outcome {
            RefundOutcome::Ok { new_used } => {
                self.cache.invalidate_usage(&params.user_id, &params.resource, &period.period_key());
                Ok(new_used)
            }
            RefundOutcome::IdempotentReplay => {
                let usage = self.read_usage_best_effort(&params.user_id, &params.resource, &period, &call).await;
                Ok(usage.used)
            }
        }
    }

    /// Tier-change proration (spec.md §4.9).
    pub async fn apply_tier_change(
        &self,
        user_id: &UserId,
        new_tier: &TierName,
        resource: &Resource,
        period_type: PeriodType,
        call: CallOptions,
    ) -> Result<(), QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        let new_tier_config = self
            .config
            .tiers
            .get(&new_tier.0)
            .ok_or_else(|| QuotaError::InvalidTier { tier: new_tier.clone() })?;

        let now = self.authoritative_now(&call).await?;
        let (subscription_start, _old_tier) = self.resolve_entitlement_and_tier(user_id, &call).await?;
        let period = compute_period(subscription_start, now, period_type);
        let usage = self.read_usage_best_effort(user_id, resource, &period, &call).await;
        let new_limit = new_tier_config.quota_for(resource, period_type);

        let new_used = match (usage.limit, new_limit) {
            (Some(old_limit), Some(new_limit)) if old_limit > 0 => {
                let fraction = usage.used as f64 / old_limit as f64;
                (fraction * new_limit as f64).round() as u64
            }
            _ => usage.used,
        };

        Self::check_cancelled(&call.cancellation)?;
        let request = TierChangeRequest {
            user_id: user_id.clone(),
            resource: resource.clone(),
            period,
            new_tier: new_tier.clone(),
            new_limit,
            new_used,
            now,
        };
        self.guarded("apply_tier_change", &call, || self.store.apply_tier_change(request.clone())).await?;

        if let Some(mut entitlement) = self.cache.get_entitlement(user_id) {
            entitlement.tier = new_tier.clone();
            entitlement.updated_at = now;
            self.set_entitlement(entitlement, call.clone()).await?;
        }
        self.cache.invalidate_usage(user_id, resource, &period.period_key());
        Ok(())
    }

    pub async fn set_entitlement(&self, entitlement: Entitlement, call: CallOptions) -> Result<(), QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        self.guarded("set_entitlement", &call, || self.store.set_entitlement(entitlement.clone())).await?;
        self.cache.put_entitlement(entitlement);
        Ok(())
    }

    pub async fn get_entitlement(&self, user_id: &UserId, call: CallOptions) -> Result<Option<Entitlement>, QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        if let Some(entitlement) = self.cache.get_entitlement(user_id) {
            return Ok(Some(entitlement));
        }
        let entitlement = self.guarded("get_entitlement", &call, || self.store.get_entitlement(user_id)).await?;
        if let Some(entitlement) = &entitlement {
            self.cache.put_entitlement(entitlement.clone());
        }
        Ok(entitlement)
    }

    /// Administrative override: directly replaces a usage row.
    pub async fn set_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
        usage: Usage,
        call: CallOptions,
    ) -> Result<(), QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        self.guarded("set_usage", &call, || self.store.set_usage(user_id, resource, period, usage.clone())).await?;
        self.cache.put_usage(user_id, resource, &period.period_key(), usage);
        Ok(())
    }

    /// Administrative override: zeroes out a usage row for the current cycle.
    pub async fn reset_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period_type: PeriodType,
        call: CallOptions,
    ) -> Result<(), QuotaError> {
        let now = self.authoritative_now(&call).await?;
        let (subscription_start, tier_name) = self.resolve_entitlement_and_tier(user_id, &call).await?;
        let tier_config = self
            .config
            .tiers
            .get(&tier_name.0)
            .ok_or_else(|| QuotaError::InvalidTier { tier: tier_name.clone() })?;
        let period = compute_period(subscription_start, now, period_type);
        let limit = tier_config.quota_for(resource, period_type);
        self.set_usage(
            user_id,
            resource,
            &period,
            Usage { used: 0, limit, tier: tier_name, updated_at: now },
            call,
        )
        .await
    }

    /// Administrative: grants a non-expiring credit pool, drawn from only
    /// when the periodic limit would deny a consume (spec.md §9 Open
    /// Question, resolved as periodic-first).
    pub async fn grant_one_time_credit(
        &self,
        user_id: &UserId,
        resource: &Resource,
        amount: u64,
        call: CallOptions,
    ) -> Result<u64, QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        let now = self.authoritative_now(&call).await?;
        let forever = compute_period(crate::period::epoch(), now, PeriodType::Forever);
        let current = self.read_usage_best_effort(user_id, resource, &forever, &call).await;
        let new_limit = current.limit.unwrap_or(0) + amount;
        let usage = Usage {
            used: current.used,
            limit: Some(new_limit),
            tier: current.tier,
            updated_at: now,
        };
        self.set_usage(user_id, resource, &forever, usage, call).await?;
        Ok(new_limit)
    }

    /// `get_current_cycle(user) -> Period`.
    pub async fn get_current_cycle(
        &self,
        user_id: &UserId,
        period_type: PeriodType,
        call: CallOptions,
    ) -> Result<Period, QuotaError> {
        Self::check_cancelled(&call.cancellation)?;
        let now = self.authoritative_now(&call).await?;
        let (subscription_start, _tier) = self.resolve_entitlement_and_tier(user_id, &call).await?;
        Ok(compute_period(subscription_start, now, period_type))
    }
}
