//! Journal Store (C3): an append-mostly record of `Entry` rows.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::Level;

use super::StoreError;
use crate::ids::{AccountId, EntryId, IdempotencyKey, UserId};
use crate::money::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "entry_type", rename_all = "snake_case")]
pub enum EntryType {
    Deposit,
    Withdrawal,
    OrderLock,
    OrderRelease,
    OrderExecute,
    Fee,
    Refund,
    Adjustment,
    Reversal,
}

impl EntryType {
    /// Entry types eligible for `reverse_entry`, per §4.6.
    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            EntryType::Deposit
                | EntryType::Withdrawal
                | EntryType::Refund
                | EntryType::Adjustment
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "entry_status", rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reversed,
}

impl EntryStatus {
    /// I6: status only moves forward, with the single exception that a
    /// `completed` entry may move to `reversed`.
    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Reversed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    /// Signed; negative = debit.
    pub value: Decimal,
    pub fee: Decimal,
    /// `value - fee` for debits, `value` for credits.
    pub net: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BalanceSnapshot {
    pub available_before: Decimal,
    pub locked_before: Decimal,
    pub total_before: Decimal,
    pub available_after: Decimal,
    pub locked_after: Decimal,
    pub total_after: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub kind: String,
    pub id: Option<String>,
    pub description: Option<String>,
    pub metadata: Json,
}

impl Default for Reference {
    fn default() -> Self {
        Self {
            kind: String::new(),
            id: None,
            description: None,
            metadata: Json::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Processing {
    pub initiated_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub attempts: i32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReversalInfo {
    pub is_reversed: bool,
    pub reversed_by: Option<UserId>,
    pub reversal_entry_id: Option<EntryId>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub user_id: UserId,
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub amount: Amount,
    pub balance_snapshot: Option<BalanceSnapshot>,
    pub reference: Reference,
    pub idempotency_key: Option<IdempotencyKey>,
    pub processing: Processing,
    pub reversal: ReversalInfo,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EntryRow {
    entry_id: EntryId,
    account_id: AccountId,
    user_id: UserId,
    entry_type: EntryType,
    status: EntryStatus,
    amount_value: Decimal,
    amount_fee: Decimal,
    amount_net: Decimal,
    currency: Currency,
    snapshot_available_before: Option<Decimal>,
    snapshot_locked_before: Option<Decimal>,
    snapshot_total_before: Option<Decimal>,
    snapshot_available_after: Option<Decimal>,
    snapshot_locked_after: Option<Decimal>,
    snapshot_total_after: Option<Decimal>,
    reference_kind: String,
    reference_id: Option<String>,
    reference_description: Option<String>,
    reference_metadata: Json,
    idempotency_key: Option<IdempotencyKey>,
    #[sqlx(try_from = "Option<SqlxTs>")]
    processing_initiated_at: Option<Timestamp>,
    #[sqlx(try_from = "Option<SqlxTs>")]
    processing_completed_at: Option<Timestamp>,
    processing_attempts: i32,
    processing_errors: Vec<String>,
    reversal_is_reversed: bool,
    reversal_reversed_by: Option<UserId>,
    reversal_entry_id: Option<EntryId>,
    reversal_reason: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    updated_at: Timestamp,
}

impl From<EntryRow> for Entry {
    fn from(r: EntryRow) -> Self {
        let balance_snapshot = r.snapshot_available_before.map(|_| BalanceSnapshot {
            available_before: r.snapshot_available_before.unwrap_or_default(),
            locked_before: r.snapshot_locked_before.unwrap_or_default(),
            total_before: r.snapshot_total_before.unwrap_or_default(),
            available_after: r.snapshot_available_after.unwrap_or_default(),
            locked_after: r.snapshot_locked_after.unwrap_or_default(),
            total_after: r.snapshot_total_after.unwrap_or_default(),
        });
        Entry {
            entry_id: r.entry_id,
            account_id: r.account_id,
            user_id: r.user_id,
            entry_type: r.entry_type,
            status: r.status,
            amount: Amount {
                value: r.amount_value,
                fee: r.amount_fee,
                net: r.amount_net,
                currency: r.currency,
            },
            balance_snapshot,
            reference: Reference {
                kind: r.reference_kind,
                id: r.reference_id,
                description: r.reference_description,
                metadata: r.reference_metadata,
            },
            idempotency_key: r.idempotency_key,
            processing: Processing {
                initiated_at: r.processing_initiated_at,
                completed_at: r.processing_completed_at,
                attempts: r.processing_attempts,
                errors: r.processing_errors,
            },
            reversal: ReversalInfo {
                is_reversed: r.reversal_is_reversed,
                reversed_by: r.reversal_reversed_by,
                reversal_entry_id: r.reversal_entry_id,
                reason: r.reversal_reason,
            },
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

const ENTRY_COLUMNS: &str = r#"
    entry_id, account_id, user_id, entry_type, status,
    amount_value, amount_fee, amount_net, currency,
    snapshot_available_before, snapshot_locked_before, snapshot_total_before,
    snapshot_available_after, snapshot_locked_after, snapshot_total_after,
    reference_kind, reference_id, reference_description, reference_metadata,
    idempotency_key, processing_initiated_at, processing_completed_at,
    processing_attempts, processing_errors,
    reversal_is_reversed, reversal_reversed_by, reversal_entry_id,
    reversal_reason, created_at, updated_at
"#;

/// Insert a brand new Entry inside the caller's open transaction. Duplicate
/// `entry_id` or `idempotency_key` surfaces as `StoreError::DuplicateKey`.
#[tracing::instrument(skip(tx, entry), err(level = Level::ERROR))]
pub async fn create_tx(
    entry: &Entry,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    let snap = entry.balance_snapshot.unwrap_or_default();
    sqlx::query(&format!(
        r#"
        INSERT INTO journal_entries (
            entry_id, account_id, user_id, entry_type, status,
            amount_value, amount_fee, amount_net, currency,
            snapshot_available_before, snapshot_locked_before, snapshot_total_before,
            snapshot_available_after, snapshot_locked_after, snapshot_total_after,
            reference_kind, reference_id, reference_description, reference_metadata,
            idempotency_key, processing_initiated_at, processing_completed_at,
            processing_attempts, processing_errors,
            reversal_is_reversed, reversal_reversed_by, reversal_entry_id,
            reversal_reason, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5,
            $6, $7, $8, $9,
            $10, $11, $12,
            $13, $14, $15,
            $16, $17, $18, $19,
            $20, $21, $22,
            $23, $24,
            $25, $26, $27,
            $28, $29, $29
        )
        "#
    ))
    .bind(entry.entry_id)
    .bind(entry.account_id)
    .bind(entry.user_id)
    .bind(entry.entry_type)
    .bind(entry.status)
    .bind(entry.amount.value)
    .bind(entry.amount.fee)
    .bind(entry.amount.net)
    .bind(entry.amount.currency)
    .bind(entry.balance_snapshot.map(|_| snap.available_before))
    .bind(entry.balance_snapshot.map(|_| snap.locked_before))
    .bind(entry.balance_snapshot.map(|_| snap.total_before))
    .bind(entry.balance_snapshot.map(|_| snap.available_after))
    .bind(entry.balance_snapshot.map(|_| snap.locked_after))
    .bind(entry.balance_snapshot.map(|_| snap.total_after))
    .bind(&entry.reference.kind)
    .bind(&entry.reference.id)
    .bind(&entry.reference.description)
    .bind(&entry.reference.metadata)
    .bind(entry.idempotency_key.clone())
    .bind(entry.processing.initiated_at.map(|t| t.to_sqlx()))
    .bind(entry.processing.completed_at.map(|t| t.to_sqlx()))
    .bind(entry.processing.attempts)
    .bind(&entry.processing.errors)
    .bind(entry.reversal.is_reversed)
    .bind(entry.reversal.reversed_by)
    .bind(entry.reversal.reversal_entry_id)
    .bind(&entry.reversal.reason)
    .bind(entry.created_at.to_sqlx())
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db) = &e
            && db.is_unique_violation()
        {
            return StoreError::DuplicateKey;
        }
        StoreError::from(e)
    })?;
    Ok(())
}

/// Replace an existing Entry's mutable fields, enforcing I6: the write is
/// rejected with `StoreError::StatusRegression` if it would not be a legal
/// forward transition.
#[tracing::instrument(skip(tx, entry), err(level = Level::ERROR))]
pub async fn update_tx(
    entry: &Entry,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    let current_status: EntryStatus =
        sqlx::query_scalar("SELECT status FROM journal_entries WHERE entry_id = $1 FOR UPDATE")
            .bind(entry.entry_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::EntryNotFound)?;

    if current_status != entry.status && !current_status.can_transition_to(entry.status) {
        return Err(StoreError::StatusRegression {
            from: format!("{current_status:?}"),
            to: format!("{:?}", entry.status),
        });
    }

    let snap = entry.balance_snapshot.unwrap_or_default();
    sqlx::query(
        r#"
        UPDATE journal_entries SET
            status = $1,
            snapshot_available_before = $2, snapshot_locked_before = $3,
            snapshot_total_before = $4, snapshot_available_after = $5,
            snapshot_locked_after = $6, snapshot_total_after = $7,
            processing_initiated_at = $8, processing_completed_at = $9,
            processing_attempts = $10, processing_errors = $11,
            reversal_is_reversed = $12, reversal_reversed_by = $13,
            reversal_entry_id = $14, reversal_reason = $15,
            updated_at = $16
        WHERE entry_id = $17
        "#,
    )
    .bind(entry.status)
    .bind(entry.balance_snapshot.map(|_| snap.available_before))
    .bind(entry.balance_snapshot.map(|_| snap.locked_before))
    .bind(entry.balance_snapshot.map(|_| snap.total_before))
    .bind(entry.balance_snapshot.map(|_| snap.available_after))
    .bind(entry.balance_snapshot.map(|_| snap.locked_after))
    .bind(entry.balance_snapshot.map(|_| snap.total_after))
    .bind(entry.processing.initiated_at.map(|t| t.to_sqlx()))
    .bind(entry.processing.completed_at.map(|t| t.to_sqlx()))
    .bind(entry.processing.attempts)
    .bind(&entry.processing.errors)
    .bind(entry.reversal.is_reversed)
    .bind(entry.reversal.reversed_by)
    .bind(entry.reversal.reversal_entry_id)
    .bind(&entry.reversal.reason)
    .bind(entry.updated_at.to_sqlx())
    .bind(entry.entry_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn get_by_entry_id(id: EntryId, pool: &PgPool) -> Result<Entry, StoreError> {
    let row = sqlx::query_as::<_, EntryRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE entry_id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::EntryNotFound)?;
    Ok(row.into())
}

/// Returns `None` when absent — per §4.3, absence is not an error.
#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn get_by_idempotency_key(
    key: &IdempotencyKey,
    pool: &PgPool,
) -> Result<Option<Entry>, StoreError> {
    let row = sqlx::query_as::<_, EntryRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE idempotency_key = $1"
    ))
    .bind(key.clone())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Entry::from))
}

/// Strictly ordered by `created_at` descending, ties broken by `entry_id`
/// lexicographic, per §4.3's ordering guarantee.
#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn list_by_account(
    account_id: AccountId,
    limit: i64,
    offset: i64,
    pool: &PgPool,
) -> Result<Vec<Entry>, StoreError> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        r#"
        SELECT {ENTRY_COLUMNS} FROM journal_entries
        WHERE account_id = $1
        ORDER BY created_at DESC, entry_id::text ASC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(account_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Entry::from).collect())
}

#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn list_by_user(
    user_id: UserId,
    limit: i64,
    offset: i64,
    pool: &PgPool,
) -> Result<Vec<Entry>, StoreError> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        r#"
        SELECT {ENTRY_COLUMNS} FROM journal_entries
        WHERE user_id = $1
        ORDER BY created_at DESC, entry_id::text ASC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Entry::from).collect())
}

#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn list_pending(limit: i64, pool: &PgPool) -> Result<Vec<Entry>, StoreError> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        r#"
        SELECT {ENTRY_COLUMNS} FROM journal_entries
        WHERE status = 'pending'
        ORDER BY created_at ASC
        LIMIT $1
        "#
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Entry::from).collect())
}

/// All entries for an account regardless of status, oldest first — used by
/// reconciliation to re-sum the journal.
#[tracing::instrument(skip(pool), err(level = Level::ERROR))]
pub async fn list_all_for_account(
    account_id: AccountId,
    pool: &PgPool,
) -> Result<Vec<Entry>, StoreError> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE account_id = $1 ORDER BY created_at ASC"
    ))
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Entry::from).collect())
}

#[tracing::instrument(skip(tx), err(level = Level::ERROR))]
pub async fn mark_reversed_tx(
    entry_id: EntryId,
    reversal: &ReversalInfo,
    now: Timestamp,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE journal_entries SET
            status = 'reversed',
            reversal_is_reversed = true,
            reversal_reversed_by = $1,
            reversal_entry_id = $2,
            reversal_reason = $3,
            updated_at = $4
        WHERE entry_id = $5 AND status = 'completed'
        "#,
    )
    .bind(reversal.reversed_by)
    .bind(reversal.reversal_entry_id)
    .bind(&reversal.reason)
    .bind(now.to_sqlx())
    .bind(entry_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::StatusRegression {
            from: "not completed".into(),
            to: "reversed".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotone() {
        assert!(EntryStatus::Pending.can_transition_to(EntryStatus::Processing));
        assert!(EntryStatus::Processing.can_transition_to(EntryStatus::Completed));
        assert!(EntryStatus::Completed.can_transition_to(EntryStatus::Reversed));
        assert!(!EntryStatus::Completed.can_transition_to(EntryStatus::Pending));
        assert!(!EntryStatus::Reversed.can_transition_to(EntryStatus::Completed));
    }

    #[test]
    fn only_the_four_credit_debit_types_are_reversible() {
        assert!(EntryType::Deposit.is_reversible());
        assert!(EntryType::Withdrawal.is_reversible());
        assert!(EntryType::Refund.is_reversible());
        assert!(EntryType::Adjustment.is_reversible());
        assert!(!EntryType::Reversal.is_reversible());
        assert!(!EntryType::OrderLock.is_reversible());
    }
}
