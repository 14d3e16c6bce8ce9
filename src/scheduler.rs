//! Background scheduler: sweeps expired locks, prunes the idempotency
//! cache, and drives due reconciliations on a fixed tick, mirroring the
//! teacher's `scheduler::Scheduler` loop.

use sqlx::PgPool;
use std::time::Duration;
use tracing::Level;

use crate::reconciliation::ReconciliationEngine;
use crate::store::{account, idempotency, lock_lease};
use crate::time::TimeSource;

pub struct Scheduler {
    pool: PgPool,
    time_source: TimeSource,
    reconciliation: ReconciliationEngine,
    tick_interval: Duration,
    reconciliation_batch_size: i64,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        reconciliation: ReconciliationEngine,
        tick_interval: Duration,
        reconciliation_batch_size: i64,
    ) -> Self {
        Self {
            pool,
            time_source,
            reconciliation,
            tick_interval,
            reconciliation_batch_size,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// Run one iteration of every sweep immediately, rather than waiting for
    /// the next `tick_interval`. Exposed for tests driving the scheduler
    /// deterministically against a mock clock.
    #[tracing::instrument(skip(self), err(level = Level::ERROR))]
    pub async fn tick(&self) -> Result<(), anyhow::Error> {
        self.sweep_expired_locks().await?;

        if let Err(e) = lock_lease::sweep_expired(&self.time_source, &self.pool).await {
            tracing::error!(error = %e, "failed to sweep expired leases");
        }
        if let Err(e) = idempotency::prune_expired(&self.time_source, &self.pool).await {
            tracing::error!(error = %e, "failed to prune idempotency cache");
        }

        let report = self
            .reconciliation
            .reconcile_due(self.reconciliation_batch_size)
            .await;
        if !report.errors.is_empty() {
            for err in &report.errors {
                tracing::error!(
                    account_id = %err.account_id,
                    error = %err.error,
                    "reconciliation failed for account"
                );
            }
        }
        tracing::debug!(
            reconciled = report.reconciled.len(),
            adjusted = report.adjusted.len(),
            failed = report.errors.len(),
            "reconciliation batch complete"
        );

        Ok(())
    }

    /// §4.2 `sweep_expired_locks`: the only account mutation not driven
    /// through the Transaction Engine, so it takes its own per-account
    /// lease directly rather than going through C6.
    #[tracing::instrument(skip(self), err(level = Level::ERROR))]
    async fn sweep_expired_locks(&self) -> Result<(), anyhow::Error> {
        let accounts = account::list_accounts_with_expired_locks(&self.time_source, &self.pool)
            .await?;

        for account_id in accounts {
            let key = lock_lease::account_key(account_id, "sweep_expired_locks");
            let lease = match lock_lease::acquire(
                &key,
                Duration::from_secs(30),
                &self.time_source,
                &self.pool,
            )
            .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::warn!(%account_id, error = %e, "could not acquire lease to sweep expired locks");
                    continue;
                }
            };

            if let Err(e) = self.sweep_account(account_id).await {
                tracing::error!(%account_id, error = %e, "failed to sweep expired locks for account");
            }

            let _ = lock_lease::release(&lease, &self.pool).await;
        }

        Ok(())
    }

    async fn sweep_account(&self, account_id: crate::ids::AccountId) -> Result<(), anyhow::Error> {
        let mut tx = self.pool.begin().await?;
        let mut acc = account::get_for_update_tx(account_id, &mut tx).await?;
        let now = self.time_source.now();

        let expired: Vec<_> = acc
            .locks
            .iter()
            .filter(|l| {
                l.status == crate::store::LockStatus::Active && l.expires_at < now
            })
            .cloned()
            .collect();

        if expired.is_empty() {
            tx.rollback().await?;
            return Ok(());
        }

        for lock in &expired {
            account::set_lock_status_tx(lock.lock_id, crate::store::LockStatus::Expired, &mut tx)
                .await?;
            acc.balance.locked -= lock.amount;
            acc.balance.available += lock.amount;
        }
        acc.balance.total = acc.balance.available + acc.balance.locked;
        acc.updated_at = now;
        acc.last_activity_at = now;

        account::update_balance_tx(
            account_id,
            acc.balance.available,
            acc.balance.locked,
            now,
            &mut tx,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
