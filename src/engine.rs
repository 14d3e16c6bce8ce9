//! Transaction Engine (C6): the only component permitted to move funds.
//!
//! Every command follows the same ten-step skeleton described in the module
//! docs of each `*_command` function: idempotency check, lease acquisition
//! with backoff, a storage transaction, aggregate load, entry creation in
//! `pending`, business-rule validation, effect application, commit, lease
//! release, idempotency publish. `LeaseGuard` makes the release step run on
//! every exit path, including a panic unwinding through the command.

use jiff::{Span, Timestamp};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use tracing::Level;

use crate::config::EngineConfig;
use crate::errors::{BusinessRuleReason, EngineError, StoreError};
use crate::ids::{AccountId, EntryId, IdempotencyKey, LockId, UserId};
use crate::money::Currency;
use crate::store::account::{self, NewLock};
use crate::store::journal::{
    self, Amount, BalanceSnapshot, Entry, EntryStatus, EntryType, Processing, Reference,
    ReversalInfo,
};
use crate::store::{idempotency, lock_lease, Account, AccountStatus, LockStatus};
use crate::time::TimeSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub entry: Entry,
    pub lock_id: Option<LockId>,
    pub expires_at: Option<Timestamp>,
    /// Set when this result was returned because of a matching prior
    /// idempotency key rather than freshly computed.
    #[serde(default)]
    pub idempotent_replay: bool,
}

impl CommandResult {
    fn fresh(entry: Entry, lock_id: Option<LockId>, expires_at: Option<Timestamp>) -> Self {
        Self {
            entry,
            lock_id,
            expires_at,
            idempotent_replay: false,
        }
    }
}

/// Releases a C4 lease on drop, best-effort, so a panic mid-command can
/// never leave an account permanently wedged. Call `release` directly on the
/// success path to surface release failures instead of swallowing them.
pub struct LeaseGuard {
    lease: Option<lock_lease::Lease>,
    pool: PgPool,
}

impl LeaseGuard {
    pub async fn release(mut self) -> Result<(), StoreError> {
        if let Some(lease) = self.lease.take() {
            lock_lease::release(&lease, &self.pool).await?;
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let _ = lock_lease::release(&lease, &pool).await;
            });
        }
    }
}

pub struct TransactionEngine {
    pool: PgPool,
    time_source: TimeSource,
    config: EngineConfig,
}

impl TransactionEngine {
    pub fn new(pool: PgPool, time_source: TimeSource, config: EngineConfig) -> Self {
        Self {
            pool,
            time_source,
            config,
        }
    }

    /// Step 2: acquire `account:<id>:<command>`, retrying with exponential
    /// backoff up to `config.max_retries` before failing with `Contention`.
    #[tracing::instrument(skip(self), err(level = Level::ERROR))]
    async fn acquire_with_backoff(&self, key: &str) -> Result<LeaseGuard, EngineError> {
        let mut attempt = 0u32;
        loop {
            match lock_lease::acquire(
                key,
                self.config.default_lock_timeout,
                &self.time_source,
                &self.pool,
            )
            .await
            {
                Ok(lease) => {
                    return Ok(LeaseGuard {
                        lease: Some(lease),
                        pool: self.pool.clone(),
                    })
                }
                Err(StoreError::Contention(_)) if attempt < self.config.max_retries => {
                    let backoff = self.config.retry_delay * 2u32.pow(attempt);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..20));
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(StoreError::Contention(k)) => return Err(EngineError::Contention(k)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Steps 1 + 10 wrap every command. `compute` runs the lease-protected
    /// body (steps 2-9) and returns the freshly computed result.
    async fn with_idempotency<F, Fut>(
        &self,
        idempotency_key: Option<&IdempotencyKey>,
        compute: F,
    ) -> Result<CommandResult, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CommandResult, EngineError>>,
    {
        if let Some(key) = idempotency_key {
            let (cached, hit) = idempotency::get(key, &self.time_source, &self.pool)
                .await
                .map_err(StoreError::from)?;
            if hit {
                let mut result = cached.expect("hit implies Some");
                result.idempotent_replay = true;
                return Ok(result);
            }
            if let Some(existing) = journal::get_by_idempotency_key(key, &self.pool)
                .await
                .map_err(EngineError::from)?
            {
                let mut result = CommandResult::fresh(existing, None, None);
                result.idempotent_replay = true;
                return Ok(result);
            }
        }

        let result = compute().await?;

        if let Some(key) = idempotency_key {
            idempotency::set(
                key,
                &result,
                self.config.idempotency_ttl,
                &self.time_source,
                &self.pool,
            )
            .await;
        }

        Ok(result)
    }

    /// `get_entry_status` — a read-through to C3, no lease or mutation
    /// involved.
    #[tracing::instrument(skip(self), err(level = Level::ERROR))]
    pub async fn get_entry_status(&self, entry_id: EntryId) -> Result<Entry, EngineError> {
        journal::get_by_entry_id(entry_id, &self.pool)
            .await
            .map_err(EngineError::from)
    }

    pub async fn create_account(
        &self,
        user_id: UserId,
        initial_balance: Decimal,
        currency: Currency,
    ) -> Result<Account, EngineError> {
        account::create(
            user_id,
            initial_balance,
            currency,
            &self.config,
            &self.time_source,
            &self.pool,
        )
        .await
        .map_err(EngineError::from)
    }

    // ---------------------------------------------------------------
    // process_entry
    // ---------------------------------------------------------------

    #[tracing::instrument(skip(self, cmd), err(level = Level::ERROR))]
    pub async fn process_entry(&self, cmd: ProcessEntryCommand) -> Result<CommandResult, EngineError> {
        self.with_idempotency(cmd.idempotency_key.as_ref(), || async {
            self.process_entry_inner(&cmd).await
        })
        .await
    }

    async fn process_entry_inner(
        &self,
        cmd: &ProcessEntryCommand,
    ) -> Result<CommandResult, EngineError> {
        if !matches!(
            cmd.entry_type,
            EntryType::Deposit
                | EntryType::Withdrawal
                | EntryType::Fee
                | EntryType::Refund
                | EntryType::Adjustment
        ) {
            return Err(EngineError::Internal(
                "process_entry called with a non-process_entry entry type".into(),
            ));
        }

        let key = lock_lease::account_key(cmd.account_id, "transaction");
        let _guard = self.acquire_with_backoff(&key).await?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut acc = account::get_for_update_tx(cmd.account_id, &mut tx)
            .await
            .map_err(EngineError::from)?;
        if acc.status != AccountStatus::Active {
            tx.rollback().await.ok();
            return Err(EngineError::AccountNotActive);
        }

        let now = self.time_source.now();
        let entry_id = EntryId::new();
        if cmd.amount.is_zero() {
            return self
                .fail_entry(
                    entry_id,
                    cmd.account_id,
                    cmd.user_id,
                    cmd.entry_type,
                    cmd.amount,
                    cmd.fee,
                    cmd.currency,
                    cmd.reference.clone(),
                    cmd.idempotency_key.clone(),
                    BusinessRuleReason::InvalidAmount,
                    now,
                    tx,
                )
                .await;
        }

        let net = if cmd.amount.is_sign_negative() {
            cmd.amount - cmd.fee
        } else {
            cmd.amount
        };

        let mut pending = new_pending_entry(
            entry_id,
            cmd.account_id,
            cmd.user_id,
            cmd.entry_type,
            cmd.amount,
            cmd.fee,
            net,
            cmd.currency,
            cmd.reference.clone(),
            cmd.idempotency_key.clone(),
            now,
        );
        journal::create_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let usage = acc.usage_today.rolled_over(now);
        let reason = if cmd.amount.is_sign_positive() {
            if cmd.amount.abs() > acc.limits.single_transaction_limit {
                Some(BusinessRuleReason::ExceedsSingleTransactionLimit)
            } else if acc.limits.daily_deposit - usage.deposited < cmd.amount.abs() {
                Some(BusinessRuleReason::ExceedsDailyLimit)
            } else {
                None
            }
        } else if acc.balance.available < cmd.amount.abs() {
            Some(BusinessRuleReason::InsufficientBalance)
        } else if acc.limits.daily_withdrawal - usage.withdrawn < cmd.amount.abs() {
            Some(BusinessRuleReason::ExceedsDailyLimit)
        } else {
            None
        };

        if let Some(reason) = reason {
            pending.status = EntryStatus::Failed;
            pending.processing.errors.push(reason.to_string());
            pending.updated_at = now;
            journal::update_tx(&pending, &mut tx)
                .await
                .map_err(EngineError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(EngineError::business(reason));
        }

        pending.status = EntryStatus::Processing;
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let before = acc.balance;
        acc.balance.available += net;
        acc.balance.total = acc.balance.available + acc.balance.locked;
        acc.usage_today = usage;
        if net.is_sign_positive() {
            acc.usage_today.deposited += net;
        } else {
            acc.usage_today.withdrawn += net.abs();
        }
        acc.usage_today.count += 1;
        acc.usage_today.last_transaction_at = Some(now);
        acc.updated_at = now;
        acc.last_activity_at = now;

        account::update_balance_tx(
            acc.id,
            acc.balance.available,
            acc.balance.locked,
            now,
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;
        account::update_bookkeeping_tx(&acc, &mut tx)
            .await
            .map_err(EngineError::from)?;

        pending.status = EntryStatus::Completed;
        pending.balance_snapshot = Some(snapshot(before, acc.balance));
        pending.processing.completed_at = Some(now);
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(CommandResult::fresh(pending, None, None))
    }

    // ---------------------------------------------------------------
    // lock_funds
    // ---------------------------------------------------------------

    #[tracing::instrument(skip(self, cmd), err(level = Level::ERROR))]
    pub async fn lock_funds(&self, cmd: LockFundsCommand) -> Result<CommandResult, EngineError> {
        self.with_idempotency(cmd.idempotency_key.as_ref(), || async {
            self.lock_funds_inner(&cmd).await
        })
        .await
    }

    async fn lock_funds_inner(&self, cmd: &LockFundsCommand) -> Result<CommandResult, EngineError> {
        let key = lock_lease::account_key(cmd.account_id, "lock_funds");
        let _guard = self.acquire_with_backoff(&key).await?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut acc = account::get_for_update_tx(cmd.account_id, &mut tx)
            .await
            .map_err(EngineError::from)?;
        if acc.status != AccountStatus::Active {
            tx.rollback().await.ok();
            return Err(EngineError::AccountNotActive);
        }

        let now = self.time_source.now();
        let entry_id = EntryId::new();
        let mut pending = new_pending_entry(
            entry_id,
            cmd.account_id,
            cmd.user_id,
            EntryType::OrderLock,
            -cmd.amount,
            Decimal::ZERO,
            -cmd.amount,
            acc.currency,
            Reference {
                kind: "order_lock".into(),
                id: Some(cmd.reference_id.clone()),
                description: Some(cmd.reason.clone()),
                metadata: serde_json::Value::Null,
            },
            cmd.idempotency_key.clone(),
            now,
        );
        journal::create_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let reason = if cmd.amount <= Decimal::ZERO {
            Some(BusinessRuleReason::InvalidAmount)
        } else if acc.balance.available < cmd.amount {
            Some(BusinessRuleReason::InsufficientBalance)
        } else if acc.active_lock_count() >= self.config.max_concurrent_locks {
            Some(BusinessRuleReason::TooManyActiveLocks)
        } else {
            None
        };

        if let Some(reason) = reason {
            pending.status = EntryStatus::Failed;
            pending.processing.errors.push(reason.to_string());
            pending.updated_at = now;
            journal::update_tx(&pending, &mut tx)
                .await
                .map_err(EngineError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(EngineError::business(reason));
        }

        pending.status = EntryStatus::Processing;
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let lock_id = LockId::new();
        let expiration = cmd.expiration.unwrap_or(self.config.lock_expiration_default);
        let expires_at = now + expiration;
        account::insert_lock_tx(
            &NewLock {
                lock_id,
                account_id: cmd.account_id,
                reference_id: cmd.reference_id.clone(),
                amount: cmd.amount,
                locked_at: now,
                expires_at,
                reason: cmd.reason.clone(),
            },
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;

        let before = acc.balance;
        acc.balance.available -= cmd.amount;
        acc.balance.locked += cmd.amount;
        acc.balance.total = acc.balance.available + acc.balance.locked;
        acc.updated_at = now;
        acc.last_activity_at = now;

        account::update_balance_tx(
            acc.id,
            acc.balance.available,
            acc.balance.locked,
            now,
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;

        pending.status = EntryStatus::Completed;
        pending.balance_snapshot = Some(snapshot(before, acc.balance));
        pending.processing.completed_at = Some(now);
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(CommandResult::fresh(pending, Some(lock_id), Some(expires_at)))
    }

    // ---------------------------------------------------------------
    // release_funds
    // ---------------------------------------------------------------

    #[tracing::instrument(skip(self, cmd), err(level = Level::ERROR))]
    pub async fn release_funds(
        &self,
        cmd: ReleaseFundsCommand,
    ) -> Result<CommandResult, EngineError> {
        self.with_idempotency(cmd.idempotency_key.as_ref(), || async {
            self.release_funds_inner(&cmd).await
        })
        .await
    }

    async fn release_funds_inner(
        &self,
        cmd: &ReleaseFundsCommand,
    ) -> Result<CommandResult, EngineError> {
        let key = lock_lease::account_key(cmd.account_id, "release_funds");
        let _guard = self.acquire_with_backoff(&key).await?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut acc = account::get_for_update_tx(cmd.account_id, &mut tx)
            .await
            .map_err(EngineError::from)?;
        if acc.status != AccountStatus::Active {
            tx.rollback().await.ok();
            return Err(EngineError::AccountNotActive);
        }

        let now = self.time_source.now();
        let entry_id = EntryId::new();
        let lock = acc
            .find_lock(cmd.lock_id)
            .cloned()
            .ok_or(EngineError::NotFound("lock"))?;

        let mut pending = new_pending_entry(
            entry_id,
            cmd.account_id,
            cmd.user_id,
            EntryType::OrderRelease,
            lock.amount,
            Decimal::ZERO,
            lock.amount,
            acc.currency,
            Reference {
                kind: "order_release".into(),
                id: Some(lock.reference_id.clone()),
                description: None,
                metadata: serde_json::Value::Null,
            },
            cmd.idempotency_key.clone(),
            now,
        );
        journal::create_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        if lock.status != LockStatus::Active {
            pending.status = EntryStatus::Failed;
            pending
                .processing
                .errors
                .push(BusinessRuleReason::LockNotActive.to_string());
            pending.updated_at = now;
            journal::update_tx(&pending, &mut tx)
                .await
                .map_err(EngineError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(EngineError::business(BusinessRuleReason::LockNotActive));
        }

        pending.status = EntryStatus::Processing;
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        account::set_lock_status_tx(lock.lock_id, LockStatus::Released, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let before = acc.balance;
        acc.balance.locked -= lock.amount;
        acc.balance.available += lock.amount;
        acc.balance.total = acc.balance.available + acc.balance.locked;
        acc.updated_at = now;
        acc.last_activity_at = now;

        account::update_balance_tx(
            acc.id,
            acc.balance.available,
            acc.balance.locked,
            now,
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;

        pending.status = EntryStatus::Completed;
        pending.balance_snapshot = Some(snapshot(before, acc.balance));
        pending.processing.completed_at = Some(now);
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(CommandResult::fresh(pending, Some(lock.lock_id), None))
    }

    // ---------------------------------------------------------------
    // execute_lock
    // ---------------------------------------------------------------

    #[tracing::instrument(skip(self, cmd), err(level = Level::ERROR))]
    pub async fn execute_lock(
        &self,
        cmd: ExecuteLockCommand,
    ) -> Result<CommandResult, EngineError> {
        self.with_idempotency(cmd.idempotency_key.as_ref(), || async {
            self.execute_lock_inner(&cmd).await
        })
        .await
    }

    async fn execute_lock_inner(
        &self,
        cmd: &ExecuteLockCommand,
    ) -> Result<CommandResult, EngineError> {
        let key = lock_lease::account_key(cmd.account_id, "execute_lock");
        let _guard = self.acquire_with_backoff(&key).await?;

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut acc = account::get_for_update_tx(cmd.account_id, &mut tx)
            .await
            .map_err(EngineError::from)?;
        if acc.status != AccountStatus::Active {
            tx.rollback().await.ok();
            return Err(EngineError::AccountNotActive);
        }

        let now = self.time_source.now();
        let entry_id = EntryId::new();
        let lock = acc
            .find_lock(cmd.lock_id)
            .cloned()
            .ok_or(EngineError::NotFound("lock"))?;

        let mut pending = new_pending_entry(
            entry_id,
            cmd.account_id,
            cmd.user_id,
            cmd.transaction_type,
            -cmd.actual_amount,
            Decimal::ZERO,
            -cmd.actual_amount,
            acc.currency,
            Reference {
                kind: "order_execute".into(),
                id: Some(lock.reference_id.clone()),
                description: None,
                metadata: serde_json::Value::Null,
            },
            cmd.idempotency_key.clone(),
            now,
        );
        journal::create_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let excess_debit = cmd.actual_amount - lock.amount;
        let reason = if lock.status != LockStatus::Active {
            Some(BusinessRuleReason::LockNotActive)
        } else if cmd.actual_amount <= Decimal::ZERO {
            Some(BusinessRuleReason::InvalidAmount)
        } else if excess_debit > Decimal::ZERO && acc.balance.available < excess_debit {
            Some(BusinessRuleReason::InsufficientBalance)
        } else {
            None
        };

        if let Some(reason) = reason {
            pending.status = EntryStatus::Failed;
            pending.processing.errors.push(reason.to_string());
            pending.updated_at = now;
            journal::update_tx(&pending, &mut tx)
                .await
                .map_err(EngineError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Err(EngineError::business(reason));
        }

        pending.status = EntryStatus::Processing;
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        account::set_lock_status_tx(lock.lock_id, LockStatus::Executed, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let before = acc.balance;
        acc.balance.locked -= lock.amount;
        if excess_debit > Decimal::ZERO {
            acc.balance.available -= excess_debit;
        } else if excess_debit < Decimal::ZERO {
            acc.balance.available += -excess_debit;
        }
        acc.balance.total = acc.balance.available + acc.balance.locked;
        acc.updated_at = now;
        acc.last_activity_at = now;

        account::update_balance_tx(
            acc.id,
            acc.balance.available,
            acc.balance.locked,
            now,
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;

        pending.status = EntryStatus::Completed;
        pending.balance_snapshot = Some(snapshot(before, acc.balance));
        pending.processing.completed_at = Some(now);
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(CommandResult::fresh(pending, Some(lock.lock_id), None))
    }

    // ---------------------------------------------------------------
    // reverse_entry
    // ---------------------------------------------------------------

    #[tracing::instrument(skip(self, cmd), err(level = Level::ERROR))]
    pub async fn reverse_entry(
        &self,
        cmd: ReverseEntryCommand,
    ) -> Result<CommandResult, EngineError> {
        self.with_idempotency(cmd.idempotency_key.as_ref(), || async {
            self.reverse_entry_inner(&cmd).await
        })
        .await
    }

    async fn reverse_entry_inner(
        &self,
        cmd: &ReverseEntryCommand,
    ) -> Result<CommandResult, EngineError> {
        let original = journal::get_by_entry_id(cmd.original_entry_id, &self.pool)
            .await
            .map_err(EngineError::from)?;

        let key = lock_lease::account_key(original.account_id, "transaction");
        let _guard = self.acquire_with_backoff(&key).await?;

        if original.status != EntryStatus::Completed {
            return Err(EngineError::business(BusinessRuleReason::NonReversibleEntry));
        }
        if !original.entry_type.is_reversible() {
            return Err(EngineError::business(BusinessRuleReason::NonReversibleEntry));
        }
        if original.reversal.is_reversed {
            return Err(EngineError::business(BusinessRuleReason::AlreadyReversed));
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut acc = account::get_for_update_tx(original.account_id, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let now = self.time_source.now();
        let entry_id = EntryId::new();
        let net = -original.amount.net;
        let mut pending = new_pending_entry(
            entry_id,
            original.account_id,
            original.user_id,
            EntryType::Reversal,
            net,
            Decimal::ZERO,
            net,
            original.amount.currency,
            Reference {
                kind: "reversal".into(),
                id: Some(original.entry_id.to_string()),
                description: Some(cmd.reason.clone()),
                metadata: serde_json::Value::Null,
            },
            cmd.idempotency_key.clone(),
            now,
        );
        journal::create_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        pending.status = EntryStatus::Processing;
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        let before = acc.balance;
        acc.balance.available += net;
        acc.balance.total = acc.balance.available + acc.balance.locked;
        acc.updated_at = now;
        acc.last_activity_at = now;

        account::update_balance_tx(
            acc.id,
            acc.balance.available,
            acc.balance.locked,
            now,
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;

        pending.status = EntryStatus::Completed;
        pending.balance_snapshot = Some(snapshot(before, acc.balance));
        pending.processing.completed_at = Some(now);
        pending.updated_at = now;
        journal::update_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;

        journal::mark_reversed_tx(
            original.entry_id,
            &ReversalInfo {
                is_reversed: true,
                reversed_by: Some(cmd.reversed_by),
                reversal_entry_id: Some(entry_id),
                reason: Some(cmd.reason.clone()),
            },
            now,
            &mut tx,
        )
        .await
        .map_err(EngineError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(CommandResult::fresh(pending, None, None))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_entry(
        &self,
        entry_id: EntryId,
        account_id: AccountId,
        user_id: UserId,
        entry_type: EntryType,
        value: Decimal,
        fee: Decimal,
        currency: Currency,
        reference: Reference,
        idempotency_key: Option<IdempotencyKey>,
        reason: BusinessRuleReason,
        now: Timestamp,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<CommandResult, EngineError> {
        let mut pending = new_pending_entry(
            entry_id, account_id, user_id, entry_type, value, fee, value, currency, reference,
            idempotency_key, now,
        );
        pending.status = EntryStatus::Failed;
        pending.processing.errors.push(reason.to_string());
        journal::create_tx(&pending, &mut tx)
            .await
            .map_err(EngineError::from)?;
        tx.commit().await.map_err(StoreError::from)?;
        Err(EngineError::business(reason))
    }
}

#[allow(clippy::too_many_arguments)]
fn new_pending_entry(
    entry_id: EntryId,
    account_id: AccountId,
    user_id: UserId,
    entry_type: EntryType,
    value: Decimal,
    fee: Decimal,
    net: Decimal,
    currency: Currency,
    reference: Reference,
    idempotency_key: Option<IdempotencyKey>,
    now: Timestamp,
) -> Entry {
    Entry {
        entry_id,
        account_id,
        user_id,
        entry_type,
        status: EntryStatus::Pending,
        amount: Amount {
            value,
            fee,
            net,
            currency,
        },
        balance_snapshot: None,
        reference,
        idempotency_key,
        processing: Processing {
            initiated_at: Some(now),
            completed_at: None,
            attempts: 1,
            errors: Vec::new(),
        },
        reversal: ReversalInfo::default(),
        created_at: now,
        updated_at: now,
    }
}

fn snapshot(before: crate::store::Balance, after: crate::store::Balance) -> BalanceSnapshot {
    BalanceSnapshot {
        available_before: before.available,
        locked_before: before.locked,
        total_before: before.total,
        available_after: after.available,
        locked_after: after.locked,
        total_after: after.total,
    }
}

#[derive(Debug, Clone)]
pub struct ProcessEntryCommand {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub entry_type: EntryType,
    /// Signed; negative = debit.
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: Currency,
    pub reference: Reference,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone)]
pub struct LockFundsCommand {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub reference_id: String,
    pub reason: String,
    pub expiration: Option<Span>,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone)]
pub struct ReleaseFundsCommand {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub lock_id: LockId,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone)]
pub struct ExecuteLockCommand {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub lock_id: LockId,
    pub actual_amount: Decimal,
    pub transaction_type: EntryType,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone)]
pub struct ReverseEntryCommand {
    pub original_entry_id: EntryId,
    pub reversed_by: UserId,
    pub reason: String,
    pub idempotency_key: Option<IdempotencyKey>,
}
