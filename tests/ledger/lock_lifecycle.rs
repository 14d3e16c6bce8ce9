use ledger_core::engine::{
    ExecuteLockCommand, LockFundsCommand, ProcessEntryCommand, ReleaseFundsCommand,
    TransactionEngine,
};
use ledger_core::ids::UserId;
use ledger_core::money::Currency;
use ledger_core::reconciliation::ReconciliationEngine;
use ledger_core::store::journal::{EntryStatus, EntryType, Reference};
use ledger_core::store::{account, LockStatus};
use ledger_core::Scheduler;
use rust_decimal::dec;
use std::time::Duration;

use crate::support::TestContext;

fn reference() -> Reference {
    Reference {
        kind: "test".into(),
        id: None,
        description: None,
        metadata: serde_json::Value::Null,
    }
}

async fn funded_account(engine: &TransactionEngine, user_id: UserId) -> ledger_core::store::Account {
    let account = engine
        .create_account(user_id, dec!(0), Currency::Usd)
        .await
        .unwrap();
    engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id,
            entry_type: EntryType::Deposit,
            amount: dec!(200.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: reference(),
            idempotency_key: None,
        })
        .await
        .unwrap();
    account
}

#[tokio::test]
async fn lock_then_release_returns_funds_to_available() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(10);
    let account = funded_account(&engine, user_id).await;

    let locked = engine
        .lock_funds(LockFundsCommand {
            account_id: account.id,
            user_id,
            amount: dec!(75.00),
            reference_id: "order-1".into(),
            reason: "checkout hold".into(),
            expiration: None,
            idempotency_key: None,
        })
        .await
        .unwrap();
    let lock_id = locked.lock_id.unwrap();

    let released = engine
        .release_funds(ReleaseFundsCommand {
            account_id: account.id,
            user_id,
            lock_id,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let snapshot = released.entry.balance_snapshot.unwrap();
    assert_eq!(snapshot.available_after, dec!(200.00));
    assert_eq!(snapshot.locked_after, dec!(0));
}

#[tokio::test]
async fn execute_lock_for_less_than_locked_returns_excess_to_available() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(11);
    let account = funded_account(&engine, user_id).await;

    let locked = engine
        .lock_funds(LockFundsCommand {
            account_id: account.id,
            user_id,
            amount: dec!(100.00),
            reference_id: "order-2".into(),
            reason: "checkout hold".into(),
            expiration: None,
            idempotency_key: None,
        })
        .await
        .unwrap();
    let lock_id = locked.lock_id.unwrap();

    let executed = engine
        .execute_lock(ExecuteLockCommand {
            account_id: account.id,
            user_id,
            lock_id,
            actual_amount: dec!(80.00),
            transaction_type: EntryType::OrderExecute,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let snapshot = executed.entry.balance_snapshot.unwrap();
    // 200 deposited, 100 locked leaves 100 available; executing 80 of the
    // 100 lock returns the 20 excess to available.
    assert_eq!(snapshot.available_after, dec!(120.00));
    assert_eq!(snapshot.locked_after, dec!(0));
    assert_eq!(executed.entry.status, EntryStatus::Completed);
}

#[tokio::test]
async fn execute_lock_for_more_than_locked_draws_the_difference_from_available() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(12);
    let account = funded_account(&engine, user_id).await;

    let locked = engine
        .lock_funds(LockFundsCommand {
            account_id: account.id,
            user_id,
            amount: dec!(50.00),
            reference_id: "order-3".into(),
            reason: "checkout hold".into(),
            expiration: None,
            idempotency_key: None,
        })
        .await
        .unwrap();
    let lock_id = locked.lock_id.unwrap();

    let executed = engine
        .execute_lock(ExecuteLockCommand {
            account_id: account.id,
            user_id,
            lock_id,
            actual_amount: dec!(60.00),
            transaction_type: EntryType::OrderExecute,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let snapshot = executed.entry.balance_snapshot.unwrap();
    // 200 deposited, 50 locked leaves 150 available; executing for 60 pulls
    // the extra 10 straight from available.
    assert_eq!(snapshot.available_after, dec!(140.00));
    assert_eq!(snapshot.locked_after, dec!(0));
}

#[tokio::test]
async fn scheduler_sweep_expires_overdue_locks_and_credits_available() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(13);
    let account = funded_account(&engine, user_id).await;

    engine
        .lock_funds(LockFundsCommand {
            account_id: account.id,
            user_id,
            amount: dec!(60.00),
            reference_id: "order-4".into(),
            reason: "checkout hold".into(),
            expiration: Some(jiff::Span::new().hours(1)),
            idempotency_key: None,
        })
        .await
        .unwrap();

    // Push the mock clock past the lock's one-hour expiration.
    ctx.time_source.advance(jiff::Span::new().hours(2));

    let reconciliation = ReconciliationEngine::new(
        ctx.pool.clone(),
        ctx.time_source.clone(),
        ctx.config.clone(),
        TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone()),
    );
    let scheduler = Scheduler::new(
        ctx.pool.clone(),
        ctx.time_source.clone(),
        reconciliation,
        Duration::from_secs(60),
        10,
    );
    scheduler.tick().await.unwrap();

    let swept = account::get_by_id(account.id, &ctx.pool).await.unwrap();
    let lock = swept.locks.iter().find(|l| l.reference_id == "order-4").unwrap();
    assert_eq!(lock.status, LockStatus::Expired);
    assert_eq!(swept.balance.available, dec!(200.00));
    assert_eq!(swept.balance.locked, dec!(0));
}
