//! Reconciliation Engine (C7): recomputes each account's balance from the
//! journal, detects drift, and repairs it with a synthetic `adjustment`
//! entry driven back through the Transaction Engine.

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::Level;

use crate::config::EngineConfig;
use crate::engine::{ProcessEntryCommand, TransactionEngine};
use crate::errors::EngineError;
use crate::ids::{AccountId, IdempotencyKey};
use crate::store::journal::{self, EntryStatus, EntryType, Reference};
use crate::store::{account, lock_lease, Account};
use crate::time::TimeSource;
use sqlx::PgPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Drift within tolerance; verification fields refreshed.
    Verified,
    /// Drift exceeded the threshold; an adjustment entry was posted.
    Adjusted { drift: Decimal },
}

#[derive(Debug)]
pub struct ReconcileError {
    pub account_id: AccountId,
    pub error: EngineError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub reconciled: Vec<AccountId>,
    pub adjusted: Vec<(AccountId, Decimal)>,
    pub errors: Vec<ReconcileError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    Verified,
    Compromised,
}

pub struct ReconciliationEngine {
    pool: PgPool,
    time_source: TimeSource,
    config: EngineConfig,
    engine: TransactionEngine,
}

impl ReconciliationEngine {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        config: EngineConfig,
        engine: TransactionEngine,
    ) -> Self {
        Self {
            pool,
            time_source,
            config,
            engine,
        }
    }

    /// §4.7 algorithm, steps 1-6.
    #[tracing::instrument(skip(self), err(level = Level::ERROR))]
    pub async fn reconcile(&self, account_id: AccountId) -> Result<ReconcileOutcome, EngineError> {
        let lease_key = lock_lease::account_key(account_id, "reconciliation");
        let lease = lock_lease::acquire(
            &lease_key,
            self.config.reconciliation_lease_ttl,
            &self.time_source,
            &self.pool,
        )
        .await
        .map_err(EngineError::from)?;

        let result = self.reconcile_under_lease(account_id).await;

        let _ = lock_lease::release(&lease, &self.pool).await;
        result
    }

    async fn reconcile_under_lease(
        &self,
        account_id: AccountId,
    ) -> Result<ReconcileOutcome, EngineError> {
        let mut acc = account::get_by_id(account_id, &self.pool)
            .await
            .map_err(EngineError::from)?;
        let entries = journal::list_all_for_account(account_id, &self.pool)
            .await
            .map_err(EngineError::from)?;

        let calculated_total: Decimal = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
            .map(|e| e.amount.net)
            .sum();

        let stored_total = acc.balance.available + acc.balance.locked;
        let drift = calculated_total - stored_total;

        if drift.abs() <= self.config.reconciliation_threshold {
            let now = self.time_source.now();
            acc.verification.last_reconciled_at = Some(now);
            acc.verification.journal_count = entries.len() as i64;
            let balance_hash = hash_balance(&acc);
            acc.verification.balance_hash = Some(balance_hash);
            acc.verification.checksum = Some(hash_checksum(&acc, &balance_hash, now));
            acc.updated_at = now;

            account::update(&acc, &self.pool)
                .await
                .map_err(EngineError::from)?;

            Ok(ReconcileOutcome::Verified)
        } else {
            let idempotency_key = IdempotencyKey::new(format!(
                "adjustment-{account_id}-{}",
                self.time_source.now().as_second()
            ));

            let cmd = ProcessEntryCommand {
                account_id,
                user_id: acc.user_id,
                entry_type: EntryType::Adjustment,
                amount: drift,
                fee: Decimal::ZERO,
                currency: acc.currency,
                reference: Reference {
                    kind: "reconciliation".into(),
                    id: None,
                    description: Some("Reconciliation adjustment".into()),
                    metadata: serde_json::Value::Null,
                },
                idempotency_key: Some(idempotency_key),
            };

            self.engine.process_entry(cmd).await?;

            Ok(ReconcileOutcome::Adjusted { drift })
        }
    }

    /// §4.7: selects due accounts from C2 and reconciles them serially;
    /// per-account errors are recorded in the batch report, not propagated.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_due(&self, batch_size: i64) -> BatchReport {
        let mut report = BatchReport::default();

        let due = match account::list_for_reconciliation(batch_size, &self.time_source, &self.pool)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "failed to list accounts due for reconciliation");
                return report;
            }
        };

        for account_id in due {
            match self.reconcile(account_id).await {
                Ok(ReconcileOutcome::Verified) => report.reconciled.push(account_id),
                Ok(ReconcileOutcome::Adjusted { drift }) => {
                    report.adjusted.push((account_id, drift))
                }
                Err(error) => report.errors.push(ReconcileError { account_id, error }),
            }
        }

        report
    }

    /// Recompute the checksum over freshly loaded state and compare against
    /// the one stored at the last reconciliation.
    #[tracing::instrument(skip(self), err(level = Level::ERROR))]
    pub async fn verify_integrity(
        &self,
        account_id: AccountId,
    ) -> Result<IntegrityStatus, EngineError> {
        let acc = account::get_by_id(account_id, &self.pool)
            .await
            .map_err(EngineError::from)?;

        let (Some(stored_hash), Some(stored_checksum)) =
            (acc.verification.balance_hash, acc.verification.checksum)
        else {
            return Ok(IntegrityStatus::Compromised);
        };

        let recomputed_hash = hash_balance(&acc);
        if recomputed_hash != stored_hash {
            return Ok(IntegrityStatus::Compromised);
        }

        let recomputed_checksum = hash_checksum(
            &acc,
            &recomputed_hash,
            acc.verification
                .last_reconciled_at
                .unwrap_or(acc.updated_at),
        );

        if recomputed_checksum == stored_checksum {
            Ok(IntegrityStatus::Verified)
        } else {
            Ok(IntegrityStatus::Compromised)
        }
    }
}

fn hash_balance(acc: &Account) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(acc.balance.available.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(acc.balance.locked.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(acc.balance.total.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(acc.currency.to_string().as_bytes());
    hasher.finalize().into()
}

fn hash_checksum(acc: &Account, balance_hash: &[u8; 32], updated_at: jiff::Timestamp) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(acc.id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(balance_hash);
    hasher.update(b"|");
    hasher.update(acc.verification.journal_count.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(updated_at.as_second().to_string().as_bytes());
    hasher.finalize().into()
}
