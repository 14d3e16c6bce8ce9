//! Account Store (C2): persist/load Account aggregates; atomic balance
//! updates.

use jiff::Timestamp;
use jiff_sqlx::ToSqlx;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::Level;

use super::journal::{
    self, Amount, BalanceSnapshot, Entry, EntryStatus, EntryType, Processing, Reference,
    ReversalInfo,
};
use super::{Account, AccountRow, AccountStatus, Lock, LockRow, LockStatus, StoreError};
use crate::config::EngineConfig;
use crate::ids::{AccountId, EntryId, LockId, UserId};
use crate::money::Currency;
use crate::time::TimeSource;

const ACCOUNT_COLUMNS: &str = r#"
    id, user_id, status, available, locked, total, currency,
    single_transaction_limit, daily_deposit_limit, daily_withdrawal_limit,
    monthly_volume_limit, usage_day, usage_deposited, usage_withdrawn,
    usage_count, usage_last_transaction_at, last_reconciled_at,
    journal_count, balance_hash, checksum, created_at, updated_at,
    last_activity_at
"#;

async fn load_locks(
    account_id: AccountId,
    pool: &PgPool,
) -> Result<Vec<Lock>, StoreError> {
    let rows = sqlx::query_as::<_, LockRow>(
        "SELECT lock_id, account_id, reference_id, amount, locked_at, \
         expires_at, status, reason FROM locks \
         WHERE account_id = $1 ORDER BY locked_at ASC",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Lock::from).collect())
}

async fn load_locks_tx(
    account_id: AccountId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Vec<Lock>, StoreError> {
    let rows = sqlx::query_as::<_, LockRow>(
        "SELECT lock_id, account_id, reference_id, amount, locked_at, \
         expires_at, status, reason FROM locks \
         WHERE account_id = $1 ORDER BY locked_at ASC",
    )
    .bind(account_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(Lock::from).collect())
}

/// Create a new account for `user_id`. Fails with
/// `StoreError::AccountAlreadyExists` if the user already has one.
///
/// A nonzero `initial_balance` is itself a funding event, so I4 requires it
/// to land in the journal, not just in `accounts.available`/`total` — this
/// books a completed `Deposit` entry for the opening balance in the same
/// transaction as the account insert.
#[tracing::instrument(skip(pool, time_source, config), err(level = Level::ERROR))]
pub async fn create(
    user_id: UserId,
    initial_balance: Decimal,
    currency: Currency,
    config: &EngineConfig,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let now = time_source.now();
    let id = AccountId::new();
    let limits = config.default_limits;
    let day = super::UsageToday::epoch_day(now);

    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, AccountRow>(&format!(
        r#"
        INSERT INTO accounts (
            id, user_id, status, available, locked, total, currency,
            single_transaction_limit, daily_deposit_limit,
            daily_withdrawal_limit, monthly_volume_limit,
            usage_day, usage_deposited, usage_withdrawn, usage_count,
            usage_last_transaction_at, last_reconciled_at, journal_count,
            balance_hash, checksum, created_at, updated_at, last_activity_at
        )
        VALUES (
            $1, $2, 'active', $3, 0, $3, $4,
            $5, $6, $7, $8,
            $9, 0, 0, 0,
            NULL, NULL, 0,
            NULL, NULL, $10, $10, $10
        )
        RETURNING {ACCOUNT_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(user_id)
    .bind(initial_balance)
    .bind(currency)
    .bind(limits.single_transaction_limit)
    .bind(limits.daily_deposit)
    .bind(limits.daily_withdrawal)
    .bind(limits.monthly_volume)
    .bind(day)
    .bind(now.to_sqlx())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db) = &e
            && db.is_unique_violation()
        {
            return StoreError::AccountAlreadyExists;
        }
        StoreError::from(e)
    })?;

    if !initial_balance.is_zero() {
        let opening_entry = Entry {
            entry_id: EntryId::new(),
            account_id: id,
            user_id,
            entry_type: EntryType::Deposit,
            status: EntryStatus::Completed,
            amount: Amount {
                value: initial_balance,
                fee: Decimal::ZERO,
                net: initial_balance,
                currency,
            },
            balance_snapshot: Some(BalanceSnapshot {
                available_before: Decimal::ZERO,
                locked_before: Decimal::ZERO,
                total_before: Decimal::ZERO,
                available_after: initial_balance,
                locked_after: Decimal::ZERO,
                total_after: initial_balance,
            }),
            reference: Reference {
                kind: "account_opening".into(),
                id: None,
                description: Some("initial balance on account creation".into()),
                metadata: serde_json::Value::Null,
            },
            idempotency_key: None,
            processing: Processing {
                initiated_at: Some(now),
                completed_at: Some(now),
                attempts: 1,
                errors: Vec::new(),
            },
            reversal: ReversalInfo::default(),
            created_at: now,
            updated_at: now,
        };
        journal::create_tx(&opening_entry, &mut tx).await?;
    }

    tx.commit().await?;

    Ok(row.into_account(Vec::new()))
}

#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn get_by_id(id: AccountId, pool: &PgPool) -> Result<Account, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::AccountNotFound)?;
    let locks = load_locks(id, pool).await?;
    Ok(row.into_account(locks))
}

#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn get_by_user_id(
    user_id: UserId,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::AccountNotFound)?;
    let locks = load_locks(row.id, pool).await?;
    Ok(row.into_account(locks))
}

/// Load an account for update inside an already-open transaction, taking a
/// row lock (`SELECT ... FOR UPDATE`) as a defense-in-depth complement to the
/// per-account lease — the lease is what actually serializes commands, this
/// just stops a stray untethered writer from racing a held lease.
#[tracing::instrument(skip(tx), err(level = Level::ERROR))]
pub async fn get_for_update_tx(
    id: AccountId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<Account, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::AccountNotFound)?;
    let locks = load_locks_tx(id, tx).await?;
    Ok(row.into_account(locks))
}

/// Optimistic full-aggregate update: fails with `StoreError::Conflict` if
/// `updated_at` has advanced since the caller's `account` was loaded.
#[tracing::instrument(skip(pool, account), err(level = Level::ERROR))]
pub async fn update(account: &Account, pool: &PgPool) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE accounts SET
            status = $1, available = $2, locked = $3, total = $4,
            single_transaction_limit = $5, daily_deposit_limit = $6,
            daily_withdrawal_limit = $7, monthly_volume_limit = $8,
            usage_day = $9, usage_deposited = $10, usage_withdrawn = $11,
            usage_count = $12, usage_last_transaction_at = $13,
            last_reconciled_at = $14, journal_count = $15,
            balance_hash = $16, checksum = $17, updated_at = $18,
            last_activity_at = $19
        WHERE id = $20 AND updated_at = $21
        "#,
    )
    .bind(account.status)
    .bind(account.balance.available)
    .bind(account.balance.locked)
    .bind(account.balance.total)
    .bind(account.limits.single_transaction_limit)
    .bind(account.limits.daily_deposit)
    .bind(account.limits.daily_withdrawal)
    .bind(account.limits.monthly_volume)
    .bind(account.usage_today.day)
    .bind(account.usage_today.deposited)
    .bind(account.usage_today.withdrawn)
    .bind(account.usage_today.count)
    .bind(account.usage_today.last_transaction_at.map(|t| t.to_sqlx()))
    .bind(account.verification.last_reconciled_at.map(|t| t.to_sqlx()))
    .bind(account.verification.journal_count)
    .bind(account.verification.balance_hash.map(|h| h.to_vec()))
    .bind(account.verification.checksum.map(|h| h.to_vec()))
    .bind(account.updated_at.to_sqlx())
    .bind(account.last_activity_at.to_sqlx())
    .bind(account.id)
    .bind(account.updated_at.to_sqlx())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict);
    }
    Ok(())
}

/// Set `available`/`locked` (and the derived `total`) inside an
/// already-open, lease-protected transaction. Bumps `updated_at` and
/// `last_activity_at` to `now`.
#[tracing::instrument(skip(tx), err(level = Level::ERROR))]
pub async fn update_balance_tx(
    id: AccountId,
    available: Decimal,
    locked: Decimal,
    now: Timestamp,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE accounts
        SET available = $1, locked = $2, total = $1 + $2,
            updated_at = $3, last_activity_at = $3
        WHERE id = $4
        "#,
    )
    .bind(available)
    .bind(locked)
    .bind(now.to_sqlx())
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Persist the usage-today counters and verification block inside a
/// transaction, without touching the balance columns (those go through
/// `update_balance_tx`).
#[tracing::instrument(skip(tx, account), err(level = Level::ERROR))]
pub async fn update_bookkeeping_tx(
    account: &Account,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE accounts SET
            usage_day = $1, usage_deposited = $2, usage_withdrawn = $3,
            usage_count = $4, usage_last_transaction_at = $5,
            last_reconciled_at = $6, journal_count = $7,
            balance_hash = $8, checksum = $9
        WHERE id = $10
        "#,
    )
    .bind(account.usage_today.day)
    .bind(account.usage_today.deposited)
    .bind(account.usage_today.withdrawn)
    .bind(account.usage_today.count)
    .bind(account.usage_today.last_transaction_at.map(|t| t.to_sqlx()))
    .bind(account.verification.last_reconciled_at.map(|t| t.to_sqlx()))
    .bind(account.verification.journal_count)
    .bind(account.verification.balance_hash.map(|h| h.to_vec()))
    .bind(account.verification.checksum.map(|h| h.to_vec()))
    .bind(account.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Accounts whose `verification.last_reconciled_at` is missing or older than
/// 24 hours, oldest first.
#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
pub async fn list_for_reconciliation(
    limit: i64,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Vec<AccountId>, StoreError> {
    let cutoff = time_source.now() - jiff::Span::new().hours(24);
    let ids: Vec<AccountId> = sqlx::query_scalar(
        r#"
        SELECT id FROM accounts
        WHERE last_reconciled_at IS NULL OR last_reconciled_at < $1
        ORDER BY last_reconciled_at ASC NULLS FIRST
        LIMIT $2
        "#,
    )
    .bind(cutoff.to_sqlx())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub struct NewLock {
    pub lock_id: LockId,
    pub account_id: AccountId,
    pub reference_id: String,
    pub amount: Decimal,
    pub locked_at: Timestamp,
    pub expires_at: Timestamp,
    pub reason: String,
}

#[tracing::instrument(skip(tx, lock), err(level = Level::ERROR))]
pub async fn insert_lock_tx(
    lock: &NewLock,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO locks (
            lock_id, account_id, reference_id, amount, locked_at,
            expires_at, status, reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'active', $7)
        "#,
    )
    .bind(lock.lock_id)
    .bind(lock.account_id)
    .bind(&lock.reference_id)
    .bind(lock.amount)
    .bind(lock.locked_at.to_sqlx())
    .bind(lock.expires_at.to_sqlx())
    .bind(&lock.reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[tracing::instrument(skip(tx), err(level = Level::ERROR))]
pub async fn set_lock_status_tx(
    lock_id: LockId,
    status: LockStatus,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE locks SET status = $1 WHERE lock_id = $2")
        .bind(status)
        .bind(lock_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Accounts holding at least one `active` lock whose `expires_at` is in the
/// past, for the sweeper.
#[tracing::instrument(skip(pool, time_source), err(level = Level::ERROR))]
pub async fn list_accounts_with_expired_locks(
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Vec<AccountId>, StoreError> {
    let now = time_source.now();
    let ids: Vec<AccountId> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT account_id FROM locks
        WHERE status = 'active' AND expires_at < $1
        "#,
    )
    .bind(now.to_sqlx())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_status_is_value_type() {
        assert_eq!(AccountStatus::Active, AccountStatus::Active);
        assert_ne!(AccountStatus::Active, AccountStatus::Suspended);
    }
}
