//! Metric sink capability (spec.md §6, §9 "Global process metrics registry").
//!
//! The teacher installs a process-wide Prometheus recorder once, at startup
//! (`gateway/src/observability.rs::setup_metrics`), and lets the `metrics`
//! crate's global facade (`counter!`, `histogram!`) do the rest. A library
//! crate can't take that shortcut — installing a recorder is the embedding
//! application's call, and installing two would panic — so the coordinator
//! depends on this trait instead and takes a no-op implementation by default.

use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::BreakerState;

/// Tags a fallback activation with the strategy that ultimately served the
/// request, or that none did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackOutcome {
    Cache,
    SecondaryStore,
    OptimisticAllowance,
    Exhausted,
}

/// Counter/histogram emission points the coordinator calls. Implementations
/// must not panic or block meaningfully; this runs on the hot path.
pub trait MetricSink: Send + Sync {
    fn consume(&self, tier: &str, resource: &str, allowed: bool) {
        let _ = (tier, resource, allowed);
    }

    fn cache_access(&self, hit: bool) {
        let _ = hit;
    }

    fn circuit_transition(&self, from: BreakerState, to: BreakerState) {
        let _ = (from, to);
    }

    fn fallback_activation(&self, outcome: FallbackOutcome) {
        let _ = outcome;
    }

    fn rate_limit_check(&self, allowed: bool, latency: Duration) {
        let _ = (allowed, latency);
    }

    fn store_latency(&self, operation: &str, latency: Duration) {
        let _ = (operation, latency);
    }
}

/// Default sink: every emission point is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {}

/// Sink backed by the `metrics` crate's global recorder facade, for callers
/// who have installed one (e.g. via `metrics-exporter-prometheus`, as the
/// teacher's gateway does).
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalMetricSink;

impl MetricSink for GlobalMetricSink {
    fn consume(&self, tier: &str, resource: &str, allowed: bool) {
        metrics::counter!(
            "quota_core_consume_total",
            "tier" => tier.to_string(),
            "resource" => resource.to_string(),
            "allowed" => allowed.to_string(),
        )
        .increment(1);
    }

    fn cache_access(&self, hit: bool) {
        metrics::counter!("quota_core_cache_access_total", "hit" => hit.to_string()).increment(1);
    }

    fn circuit_transition(&self, from: BreakerState, to: BreakerState) {
        metrics::counter!(
            "quota_core_circuit_transitions_total",
            "from" => from.to_string(),
            "to" => to.to_string(),
        )
        .increment(1);
    }

    fn fallback_activation(&self, outcome: FallbackOutcome) {
        let label = match outcome {
            FallbackOutcome::Cache => "cache",
            FallbackOutcome::SecondaryStore => "secondary_store",
            FallbackOutcome::OptimisticAllowance => "optimistic_allowance",
            FallbackOutcome::Exhausted => "exhausted",
        };
        metrics::counter!("quota_core_fallback_activations_total", "outcome" => label).increment(1);
    }

    fn rate_limit_check(&self, allowed: bool, latency: Duration) {
        metrics::counter!("quota_core_rate_limit_checks_total", "allowed" => allowed.to_string())
            .increment(1);
        metrics::histogram!("quota_core_rate_limit_check_latency_seconds").record(latency.as_secs_f64());
    }

    fn store_latency(&self, operation: &str, latency: Duration) {
        metrics::histogram!("quota_core_store_latency_seconds", "operation" => operation.to_string())
            .record(latency.as_secs_f64());
    }
}

/// Shared handle to an injected sink, defaulting to `NoopMetricSink`.
pub type SharedMetricSink = Arc<dyn MetricSink>;

pub fn noop_sink() -> SharedMetricSink {
    Arc::new(NoopMetricSink)
}
