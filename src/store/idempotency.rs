//! Idempotency Cache (C5): an optimization over the Journal's uniqueness
//! constraint, never the source of truth. A `set` failure is logged and
//! swallowed rather than propagated — correctness never depends on this
//! cache actually holding anything.

use jiff::Span;
use jiff_sqlx::ToSqlx;
use sqlx::PgPool;
use std::time::Duration;
use tracing::Level;

use crate::engine::CommandResult;
use crate::ids::IdempotencyKey;
use crate::time::TimeSource;

/// `(result, true)` on a hit, `(_, false)` on a miss, matching §4.5's
/// signature exactly rather than an `Option`.
#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
pub async fn get(
    key: &IdempotencyKey,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<(Option<CommandResult>, bool), sqlx::Error> {
    let row: Option<(serde_json::Value,)> = sqlx::query_as(
        "SELECT result FROM idempotency_cache WHERE key = $1 AND expires_at > $2",
    )
    .bind(key.clone())
    .bind(time_source.now().to_sqlx())
    .fetch_optional(pool)
    .await?;

    match row {
        Some((json,)) => {
            let result: Option<CommandResult> = serde_json::from_value(json).ok();
            let hit = result.is_some();
            Ok((result, hit))
        }
        None => Ok((None, false)),
    }
}

/// Best-effort: any failure is logged at `warn` and discarded.
pub async fn set(
    key: &IdempotencyKey,
    result: &CommandResult,
    ttl: Duration,
    time_source: &TimeSource,
    pool: &PgPool,
) {
    if let Err(e) = try_set(key, result, ttl, time_source, pool).await {
        tracing::warn!(error = %e, %key, "failed to write idempotency cache entry");
    }
}

#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
async fn try_set(
    key: &IdempotencyKey,
    result: &CommandResult,
    ttl: Duration,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<(), anyhow::Error> {
    let now = time_source.now();
    let expires_at = now + Span::try_from(ttl)?;
    let json = serde_json::to_value(result)?;

    sqlx::query(
        r#"
        INSERT INTO idempotency_cache (key, result, created_at, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (key) DO UPDATE SET
            result = EXCLUDED.result,
            expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(key.clone())
    .bind(json)
    .bind(now.to_sqlx())
    .bind(expires_at.to_sqlx())
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop entries past their TTL. Called by the scheduler alongside the
/// expired-lock sweep.
#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
pub async fn prune_expired(time_source: &TimeSource, pool: &PgPool) -> Result<u64, sqlx::Error> {
    let now = time_source.now();
    let result = sqlx::query("DELETE FROM idempotency_cache WHERE expires_at < $1")
        .bind(now.to_sqlx())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
