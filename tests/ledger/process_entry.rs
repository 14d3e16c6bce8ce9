use ledger_core::engine::{ProcessEntryCommand, TransactionEngine};
use ledger_core::ids::{IdempotencyKey, UserId};
use ledger_core::money::Currency;
use ledger_core::store::journal::{EntryStatus, EntryType, Reference};
use rust_decimal::dec;

use crate::support::TestContext;

fn deposit_reference() -> Reference {
    Reference {
        kind: "test".into(),
        id: None,
        description: None,
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn deposit_increases_available_and_total() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());

    let account = engine
        .create_account(UserId(1), dec!(0), Currency::Usd)
        .await
        .unwrap();

    let result = engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id: UserId(1),
            entry_type: EntryType::Deposit,
            amount: dec!(100.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: deposit_reference(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    assert_eq!(result.entry.status, EntryStatus::Completed);
    let snapshot = result.entry.balance_snapshot.unwrap();
    assert_eq!(snapshot.available_after, dec!(100.00));
    assert_eq!(snapshot.total_after, dec!(100.00));
}

#[tokio::test]
async fn withdrawal_beyond_available_is_rejected() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());

    let account = engine
        .create_account(UserId(2), dec!(10.00), Currency::Usd)
        .await
        .unwrap();

    let err = engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id: UserId(2),
            entry_type: EntryType::Withdrawal,
            amount: dec!(-50.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: deposit_reference(),
            idempotency_key: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ledger_core::EngineError::BusinessRuleFailure(
            ledger_core::BusinessRuleReason::InsufficientBalance
        )
    ));
}

#[tokio::test]
async fn repeated_idempotency_key_replays_first_result() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());

    let account = engine
        .create_account(UserId(3), dec!(0), Currency::Usd)
        .await
        .unwrap();
    let key = IdempotencyKey::new("deposit-once");

    let first = engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id: UserId(3),
            entry_type: EntryType::Deposit,
            amount: dec!(20.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: deposit_reference(),
            idempotency_key: Some(key.clone()),
        })
        .await
        .unwrap();
    assert!(!first.idempotent_replay);

    let second = engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id: UserId(3),
            entry_type: EntryType::Deposit,
            amount: dec!(20.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: deposit_reference(),
            idempotency_key: Some(key),
        })
        .await
        .unwrap();

    assert!(second.idempotent_replay);
    assert_eq!(second.entry.entry_id, first.entry.entry_id);

    let reloaded = engine.get_entry_status(first.entry.entry_id).await.unwrap();
    assert_eq!(reloaded.status, EntryStatus::Completed);
}
