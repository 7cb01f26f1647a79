//! Configuration schema (spec.md §6) and TOML loading, following the
//! teacher's `gateway/src/config_parser.rs` convention: `#[serde(deny_unknown_fields)]`
//! structs plus a `TryFrom<toml::Table>` entry point.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::types::TierConfig;

/// Top-level configuration for the quota core.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub default_tier: String,
    pub tiers: BTreeMap<String, TierConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl CoreConfig {
    /// Validates cross-references the schema itself can't express: every tier
    /// the configuration names must in turn be internally consistent, and
    /// `default_tier` must resolve to a configured tier.
    pub fn validate(&self) -> Result<(), QuotaError> {
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(QuotaError::InvalidTier {
                tier: self.default_tier.as_str().into(),
            });
        }
        for thresholds in self.tiers.values().flat_map(|t| t.warning_thresholds.values()) {
            let mut prev: Option<f64> = None;
            for &threshold in thresholds {
                if threshold <= 0.0 || threshold >= 1.0 {
                    return Err(QuotaError::Internal {
                        message: format!("warning threshold {threshold} is out of range (0,1)"),
                    });
                }
                if let Some(prev) = prev {
                    if threshold <= prev {
                        return Err(QuotaError::Internal {
                            message: "warning thresholds must be strictly ascending".to_string(),
                        });
                    }
                }
                prev = Some(threshold);
            }
        }
        Ok(())
    }

    /// Parses a TOML document into a validated `CoreConfig`.
    pub fn from_toml_str(raw: &str) -> Result<Self, QuotaError> {
        let table: toml::Table = raw.parse().map_err(|e| QuotaError::Internal {
            message: format!("failed to parse TOML: {e}"),
        })?;
        Self::try_from(table)
    }
}

impl TryFrom<toml::Table> for CoreConfig {
    type Error = QuotaError;

    fn try_from(table: toml::Table) -> Result<Self, Self::Error> {
        let config: CoreConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e| QuotaError::Internal {
                message: format!("failed to parse config: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }
}

/// Cache sizing (spec.md §6 `cache.*`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "crate::serde_util::seconds")]
    pub entitlement_ttl: Duration,
    #[serde(with = "crate::serde_util::seconds")]
    pub usage_ttl: Duration,
    pub max_entitlements: u64,
    pub max_usage: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entitlement_ttl: Duration::from_secs(60),
            usage_ttl: Duration::from_secs(10),
            max_entitlements: 100_000,
            max_usage: 500_000,
        }
    }
}

/// Circuit breaker tuning (spec.md §6 `circuit_breaker.*`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    #[serde(with = "crate::serde_util::seconds")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Fallback chain configuration (spec.md §6 `fallback.*`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub fallback_to_cache: bool,
    pub optimistic_allowance: bool,
    pub optimistic_percentage: f64,
    #[serde(with = "crate::serde_util::seconds")]
    pub max_staleness: Duration,
    pub secondary_store: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_cache: true,
            optimistic_allowance: false,
            optimistic_percentage: 0.1,
            max_staleness: Duration::from_secs(30),
            secondary_store: false,
        }
    }
}
