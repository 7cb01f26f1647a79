//! Reference Postgres-backed `Store` (feature `postgres`), playing the role
//! the teacher's `db::postgres::PostgresConnectionInfo` plays for its own
//! `RateLimitQueries`/inference-counting backends: a thin wrapper around a
//! `sqlx::PgPool`, one transaction per call, row-level locking in place of an
//! in-process mutex.
//!
//! Not the focus of this crate — `store::memory` is what the test suite and
//! the fallback chain actually exercise — but kept to the same atomicity
//! contract so a deployment can swap backends without touching the
//! coordinator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::types::{
    Entitlement, IdempotencyKey, IdempotencyRecord, Period, PeriodType, RateLimitAlgorithm,
    RateLimitStatus, RefundKey, RefundReason, RefundRecord, Resource, SlidingWindowState,
    TierName, TokenBucketState, Usage, UserId,
};

use super::{
    ConsumeOutcome, ConsumeRequest, RateLimitRequest, RefundOutcome, RefundRequest, Store,
    TierChangeRequest,
};

fn sqlx_error(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        message: err.to_string(),
    }
}

fn period_type_str(period_type: PeriodType) -> &'static str {
    match period_type {
        PeriodType::Daily => "daily",
        PeriodType::Monthly => "monthly",
        PeriodType::Forever => "forever",
    }
}

/// Serializes every writer touching one `(user, resource, period)` usage row
/// for the rest of the transaction, including writers racing to INSERT the
/// row's first version (a plain `SELECT ... FOR UPDATE` locks nothing when
/// the row doesn't exist yet, which is exactly the case an `ON CONFLICT`
/// upsert needs guarded). Held until the transaction commits or rolls back.
async fn lock_usage_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &UserId,
    resource: &Resource,
    period_key: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("quota_usage:{}:{}:{}", user_id.0, resource.0, period_key))
        .execute(&mut **tx)
        .await
        .map_err(sqlx_error)?;
    Ok(())
}

/// Connects the core to a Postgres database. Call [`PostgresStore::migrate`]
/// once at startup before issuing any other call.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables this backend depends on if they don't already
    /// exist. Intentionally not a `sqlx` migration directory: this crate is
    /// embedded as a library, not deployed as its own service with its own
    /// migration runner.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS quota_entitlements (
                user_id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                subscription_start_date TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS quota_usage (
                user_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                period_key TEXT NOT NULL,
                used BIGINT NOT NULL,
                quota_limit BIGINT,
                tier TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, resource, period_key)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS quota_idempotency (
                idempotency_key TEXT PRIMARY KEY,
                new_used BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS quota_refunds (
                refund_key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                amount BIGINT NOT NULL,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL,
                period_type TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS quota_token_buckets (
                user_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                tokens DOUBLE PRECISION NOT NULL,
                last_refill TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, resource)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS quota_sliding_windows (
                user_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                timestamps JSONB NOT NULL,
                PRIMARY KEY (user_id, resource)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }
}

fn row_to_usage(tier: String, used: i64, limit: Option<i64>, updated_at: DateTime<Utc>) -> Usage {
    Usage {
        used: u64::try_from(used).unwrap_or(0),
        limit: limit.map(|l| u64::try_from(l).unwrap_or(0)),
        tier: TierName(tier),
        updated_at,
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_entitlement(&self, user_id: &UserId) -> Result<Option<Entitlement>, StoreError> {
        let row = sqlx::query(
            "SELECT tier, subscription_start_date, updated_at FROM quota_entitlements WHERE user_id = $1",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(row.map(|row| Entitlement {
            user_id: user_id.clone(),
            tier: TierName(row.get("tier")),
            subscription_start_date: row.get("subscription_start_date"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn set_entitlement(&self, entitlement: Entitlement) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO quota_entitlements (user_id, tier, subscription_start_date, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET tier = EXCLUDED.tier,
                subscription_start_date = EXCLUDED.subscription_start_date,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&entitlement.user_id.0)
        .bind(&entitlement.tier.0)
        .bind(entitlement.subscription_start_date)
        .bind(entitlement.updated_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(())
    }

    async fn get_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
    ) -> Result<Option<Usage>, StoreError> {
        let row = sqlx::query(
            "SELECT tier, used, quota_limit, updated_at FROM quota_usage
             WHERE user_id = $1 AND resource = $2 AND period_key = $3",
        )
        .bind(&user_id.0)
        .bind(&resource.0)
        .bind(period.period_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(row.map(|row| {
            row_to_usage(
                row.get("tier"),
                row.get("used"),
                row.get("quota_limit"),
                row.get("updated_at"),
            )
        }))
    }

    async fn set_usage(
        &self,
        user_id: &UserId,
        resource: &Resource,
        period: &Period,
        usage: Usage,
    ) -> Result<(), StoreError> {
        let used = i64::try_from(usage.used).unwrap_or(i64::MAX);
        let limit = usage.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        sqlx::query(
            r"
            INSERT INTO quota_usage (user_id, resource, period_key, used, quota_limit, tier, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, resource, period_key) DO UPDATE
            SET used = EXCLUDED.used,
                quota_limit = EXCLUDED.quota_limit,
                tier = EXCLUDED.tier,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&user_id.0)
        .bind(&resource.0)
        .bind(period.period_key())
        .bind(used)
        .bind(limit)
        .bind(&usage.tier.0)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(())
    }

    /// Locks the usage row for the duration of the transaction so concurrent
    /// consumers of the same `(user, resource, period)` serialize, matching
    /// the atomicity `store::memory::MemoryStore` gets from its single mutex.
    async fn consume_quota(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error)?;
        let period_key = request.period.period_key();
        lock_usage_row(&mut tx, &request.user_id, &request.resource, &period_key).await?;

        if let Some(idempotency_key) = &request.idempotency_key {
            let existing = sqlx::query("SELECT new_used FROM quota_idempotency WHERE idempotency_key = $1")
                .bind(&idempotency_key.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(sqlx_error)?;
            if let Some(row) = existing {
                let new_used: i64 = row.get("new_used");
                return Ok(ConsumeOutcome::IdempotentReplay {
                    new_used: u64::try_from(new_used).unwrap_or(0),
                });
            }
        }

        let row = sqlx::query(
            "SELECT used, quota_limit FROM quota_usage
             WHERE user_id = $1 AND resource = $2 AND period_key = $3 FOR UPDATE",
        )
        .bind(&request.user_id.0)
        .bind(&request.resource.0)
        .bind(&period_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error)?;

        let current_used: i64 = row.as_ref().map_or(0, |row| row.get("used"));
        let limit = request.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let amount = i64::try_from(request.amount).unwrap_or(i64::MAX);

        if let Some(limit) = limit {
            if current_used + amount > limit {
                tx.commit().await.map_err(sqlx_error)?;
                return Ok(ConsumeOutcome::QuotaExceeded {
                    current_used: u64::try_from(current_used).unwrap_or(0),
                });
            }
        }

        let new_used = current_used + amount;
        sqlx::query(
            r"
            INSERT INTO quota_usage (user_id, resource, period_key, used, quota_limit, tier, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, resource, period_key) DO UPDATE
            SET used = EXCLUDED.used, updated_at = EXCLUDED.updated_at",
        )
        .bind(&request.user_id.0)
        .bind(&request.resource.0)
        .bind(&period_key)
        .bind(new_used)
        .bind(limit)
        .bind(&request.tier.0)
        .bind(request.now)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error)?;

        if let Some(idempotency_key) = &request.idempotency_key {
            sqlx::query(
                "INSERT INTO quota_idempotency (idempotency_key, new_used, created_at) VALUES ($1, $2, $3)",
            )
            .bind(&idempotency_key.0)
            .bind(new_used)
            .bind(request.now)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error)?;
        }

        tx.commit().await.map_err(sqlx_error)?;
        Ok(ConsumeOutcome::Ok {
            new_used: u64::try_from(new_used).unwrap_or(0),
        })
    }

    async fn refund_quota(&self, request: RefundRequest) -> Result<RefundOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error)?;
        let period_key = request.period.period_key();
        lock_usage_row(&mut tx, &request.user_id, &request.resource, &period_key).await?;

        let existing = sqlx::query("SELECT 1 AS present FROM quota_refunds WHERE refund_key = $1")
            .bind(&request.refund_key.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_error)?;
        if existing.is_some() {
            tx.commit().await.map_err(sqlx_error)?;
            return Ok(RefundOutcome::IdempotentReplay);
        }

        let row = sqlx::query(
            "SELECT used, quota_limit, tier FROM quota_usage
             WHERE user_id = $1 AND resource = $2 AND period_key = $3 FOR UPDATE",
        )
        .bind(&request.user_id.0)
        .bind(&request.resource.0)
        .bind(&period_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_error)?;
        let current_used: i64 = row.as_ref().map_or(0, |row| row.get("used"));
        let limit: Option<i64> = row.as_ref().and_then(|row| row.get("quota_limit"));
        let tier: String = row.as_ref().map_or_else(|| "unknown".to_string(), |row| row.get("tier"));
        let amount = i64::try_from(request.amount).unwrap_or(i64::MAX);
        let new_used = (current_used - amount).max(0);

        // Upsert rather than a plain UPDATE: a refund against a resource that
        // was never consumed must still create the row (matching
        // `MemoryStore`, which defaults to a zeroed `Usage` row), not
        // silently match zero rows.
        sqlx::query(
            r"
            INSERT INTO quota_usage (user_id, resource, period_key, used, quota_limit, tier, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, resource, period_key) DO UPDATE
            SET used = EXCLUDED.used, updated_at = EXCLUDED.updated_at",
        )
        .bind(&request.user_id.0)
        .bind(&request.resource.0)
        .bind(&period_key)
        .bind(new_used)
        .bind(limit)
        .bind(&tier)
        .bind(request.now)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error)?;

        sqlx::query(
            r"
            INSERT INTO quota_refunds
                (refund_key, user_id, resource, amount, period_start, period_end, period_type, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&request.refund_key.0)
        .bind(&request.user_id.0)
        .bind(&request.resource.0)
        .bind(amount)
        .bind(request.period.start)
        .bind(request.period.end)
        .bind(period_type_str(request.period.period_type))
        .bind(&request.reason.0)
        .bind(request.now)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_error)?;

        tx.commit().await.map_err(sqlx_error)?;
        Ok(RefundOutcome::Ok {
            new_used: u64::try_from(new_used).unwrap_or(0),
        })
    }

    async fn get_refund_record(&self, key: &RefundKey) -> Result<Option<RefundRecord>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT user_id, resource, amount, period_start, period_end, period_type, reason, created_at
            FROM quota_refunds WHERE refund_key = $1",
        )
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(row.map(|row| {
            let period_type: String = row.get("period_type");
            let period_type = match period_type.as_str() {
                "daily" => PeriodType::Daily,
                "forever" => PeriodType::Forever,
                _ => PeriodType::Monthly,
            };
            let amount: i64 = row.get("amount");
            RefundRecord {
                user_id: UserId(row.get("user_id")),
                resource: Resource(row.get("resource")),
                amount: u64::try_from(amount).unwrap_or(0),
                period: Period {
                    start: row.get("period_start"),
                    end: row.get("period_end"),
                    period_type,
                },
                reason: RefundReason(row.get("reason")),
                timestamp: row.get("created_at"),
            }
        }))
    }

    async fn get_consumption_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT new_used, created_at FROM quota_idempotency WHERE idempotency_key = $1",
        )
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error)?;

        Ok(row.map(|row| {
            let new_used: i64 = row.get("new_used");
            IdempotencyRecord {
                new_used: u64::try_from(new_used).unwrap_or(0),
                timestamp: row.get("created_at"),
            }
        }))
    }

    async fn apply_tier_change(&self, request: TierChangeRequest) -> Result<(), StoreError> {
        let new_limit = request.new_limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let new_used = i64::try_from(request.new_used).unwrap_or(i64::MAX);
        sqlx::query(
            r"
            INSERT INTO quota_usage (user_id, resource, period_key, used, quota_limit, tier, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, resource, period_key) DO UPDATE
            SET used = EXCLUDED.used, quota_limit = EXCLUDED.quota_limit, tier = EXCLUDED.tier, updated_at = EXCLUDED.updated_at",
        )
        .bind(&request.user_id.0)
        .bind(&request.resource.0)
        .bind(request.period.period_key())
        .bind(new_used)
        .bind(new_limit)
        .bind(&request.new_tier.0)
        .bind(request.now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error)?;
        Ok(())
    }

    async fn check_rate_limit(&self, request: RateLimitRequest) -> Result<RateLimitStatus, StoreError> {
        self.evaluate_rate_limit(request, true).await
    }

    async fn peek_rate_limit(&self, request: RateLimitRequest) -> Result<RateLimitStatus, StoreError> {
        self.evaluate_rate_limit(request, false).await
    }

    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query("SELECT now() AS now")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error)?;
        Ok(row.get("now"))
    }
}

impl PostgresStore {
    async fn evaluate_rate_limit(
        &self,
        request: RateLimitRequest,
        mutate: bool,
    ) -> Result<RateLimitStatus, StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_error)?;

        let status = match request.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let row = sqlx::query(
                    "SELECT tokens, last_refill FROM quota_token_buckets
                     WHERE user_id = $1 AND resource = $2 FOR UPDATE",
                )
                .bind(&request.user_id.0)
                .bind(&request.resource.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(sqlx_error)?;
                let state = row.map(|row| TokenBucketState {
                    tokens: row.get("tokens"),
                    last_refill: row.get("last_refill"),
                });
                let (status, next) = crate::rate_limiter::token_bucket::apply(
                    state,
                    request.cost,
                    request.rate,
                    request.window,
                    request.burst,
                    request.now,
                    mutate,
                );
                if let Some(next) = next {
                    sqlx::query(
                        r"
                        INSERT INTO quota_token_buckets (user_id, resource, tokens, last_refill)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (user_id, resource) DO UPDATE
                        SET tokens = EXCLUDED.tokens, last_refill = EXCLUDED.last_refill",
                    )
                    .bind(&request.user_id.0)
                    .bind(&request.resource.0)
                    .bind(next.tokens)
                    .bind(next.last_refill)
                    .execute(&mut *tx)
                    .await
                    .map_err(sqlx_error)?;
                }
                status
            }
            RateLimitAlgorithm::SlidingWindow => {
                let row = sqlx::query(
                    "SELECT timestamps FROM quota_sliding_windows
                     WHERE user_id = $1 AND resource = $2 FOR UPDATE",
                )
                .bind(&request.user_id.0)
                .bind(&request.resource.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(sqlx_error)?;
                let state = row
                    .map(|row| -> Result<SlidingWindowState, StoreError> {
                        let raw: serde_json::Value = row.get("timestamps");
                        let timestamps = serde_json::from_value(raw).map_err(|err| {
                            StoreError::Serialization {
                                message: err.to_string(),
                            }
                        })?;
                        Ok(SlidingWindowState { timestamps })
                    })
                    .transpose()?;
                let (status, next) = crate::rate_limiter::sliding_window::apply(
                    state.as_ref(),
                    request.rate,
                    request.window,
                    request.now,
                    mutate,
                );
                if let Some(next) = next {
                    let raw = serde_json::to_value(&next.timestamps).map_err(|err| {
                        StoreError::Serialization {
                            message: err.to_string(),
                        }
                    })?;
                    sqlx::query(
                        r"
                        INSERT INTO quota_sliding_windows (user_id, resource, timestamps)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (user_id, resource) DO UPDATE
                        SET timestamps = EXCLUDED.timestamps",
                    )
                    .bind(&request.user_id.0)
                    .bind(&request.resource.0)
                    .bind(raw)
                    .execute(&mut *tx)
                    .await
                    .map_err(sqlx_error)?;
                }
                status
            }
        };

        tx.commit().await.map_err(sqlx_error)?;
        Ok(status)
    }
}
