//! Distributed Lock Service (C4): a leased named-mutex backed by a `leases`
//! table instead of Redis/etcd, keeping the store on the same Postgres
//! connection pool as everything else rather than pulling in a dependency
//! the rest of the crate has no other use for.

use jiff::{Span, Timestamp};
use jiff_sqlx::ToSqlx;
use sqlx::PgPool;
use std::time::Duration;
use tracing::Level;
use uuid::Uuid;

use super::StoreError;
use crate::time::TimeSource;

#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: Uuid,
    pub ttl: Duration,
    pub acquired_at: Timestamp,
}

/// Atomically claim `key` for the caller if it is free or its prior holder's
/// TTL has expired. Fails with `StoreError::Contention` otherwise.
#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
pub async fn acquire(
    key: &str,
    ttl: Duration,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Lease, StoreError> {
    let now = time_source.now();
    let token = Uuid::new_v4();
    let expires_at = now + Span::try_from(ttl).map_err(|e| {
        StoreError::UnexpectedError(anyhow::anyhow!("lease ttl out of range: {e}"))
    })?;

    let claimed: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO leases (key, token, acquired_at, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (key) DO UPDATE SET
            token = EXCLUDED.token,
            acquired_at = EXCLUDED.acquired_at,
            expires_at = EXCLUDED.expires_at
        WHERE leases.expires_at < $3
        RETURNING token
        "#,
    )
    .bind(key)
    .bind(token)
    .bind(now.to_sqlx())
    .bind(expires_at.to_sqlx())
    .fetch_optional(pool)
    .await?;

    match claimed {
        Some(t) if t == token => Ok(Lease {
            key: key.to_string(),
            token,
            ttl,
            acquired_at: now,
        }),
        _ => Err(StoreError::Contention(key.to_string())),
    }
}

/// Compare-and-delete: no-op if the lease has already expired or been stolen
/// by a successor holder, so it's always safe to call on every exit path.
#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn release(lease: &Lease, pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM leases WHERE key = $1 AND token = $2")
        .bind(&lease.key)
        .bind(lease.token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Compare-and-expire: refreshes the TTL only if the caller still owns the
/// token. Fails with `StoreError::Contention` if ownership was lost.
#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
pub async fn extend(
    lease: &Lease,
    ttl: Duration,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Lease, StoreError> {
    let now = time_source.now();
    let expires_at = now + Span::try_from(ttl).map_err(|e| {
        StoreError::UnexpectedError(anyhow::anyhow!("lease ttl out of range: {e}"))
    })?;

    let result = sqlx::query(
        "UPDATE leases SET expires_at = $1 WHERE key = $2 AND token = $3",
    )
    .bind(expires_at.to_sqlx())
    .bind(&lease.key)
    .bind(lease.token)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Contention(lease.key.clone()));
    }

    Ok(Lease {
        key: lease.key.clone(),
        token: lease.token,
        ttl,
        acquired_at: lease.acquired_at,
    })
}

/// `account:<id>:<op>` naming convention, §4.4.
pub fn account_key(account_id: crate::ids::AccountId, op: &str) -> String {
    format!("account:{account_id}:{op}")
}

/// `idempotency:<key>` naming convention, §4.4.
pub fn idempotency_key_lease_name(key: &crate::ids::IdempotencyKey) -> String {
    format!("idempotency:{key}")
}

#[tracing::instrument(skip(pool, time_source))]
pub async fn sweep_expired(time_source: &TimeSource, pool: &PgPool) -> Result<u64, StoreError> {
    let now = time_source.now();
    let result = sqlx::query("DELETE FROM leases WHERE expires_at < $1")
        .bind(now.to_sqlx())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
