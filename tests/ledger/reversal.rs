use ledger_core::engine::{ProcessEntryCommand, ReverseEntryCommand, TransactionEngine};
use ledger_core::ids::UserId;
use ledger_core::money::Currency;
use ledger_core::store::journal::{EntryStatus, EntryType, Reference};
use ledger_core::{BusinessRuleReason, EngineError};
use rust_decimal::dec;

use crate::support::TestContext;

fn reference() -> Reference {
    Reference {
        kind: "test".into(),
        id: None,
        description: None,
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn reversing_a_deposit_debits_the_account_and_marks_the_original_reversed() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(20);

    let account = engine
        .create_account(user_id, dec!(0), Currency::Usd)
        .await
        .unwrap();

    let deposit = engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id,
            entry_type: EntryType::Deposit,
            amount: dec!(50.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: reference(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    let reversal = engine
        .reverse_entry(ReverseEntryCommand {
            original_entry_id: deposit.entry.entry_id,
            reversed_by: user_id,
            reason: "duplicate deposit".into(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    assert_eq!(reversal.entry.entry_type, EntryType::Reversal);
    let snapshot = reversal.entry.balance_snapshot.unwrap();
    assert_eq!(snapshot.available_after, dec!(0));

    let original = engine.get_entry_status(deposit.entry.entry_id).await.unwrap();
    assert_eq!(original.status, EntryStatus::Reversed);
    assert!(original.reversal.is_reversed);
    assert_eq!(original.reversal.reversal_entry_id, Some(reversal.entry.entry_id));
}

#[tokio::test]
async fn reversing_an_already_reversed_entry_is_rejected() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(21);

    let account = engine
        .create_account(user_id, dec!(0), Currency::Usd)
        .await
        .unwrap();
    let deposit = engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id,
            entry_type: EntryType::Deposit,
            amount: dec!(50.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: reference(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    engine
        .reverse_entry(ReverseEntryCommand {
            original_entry_id: deposit.entry.entry_id,
            reversed_by: user_id,
            reason: "first reversal".into(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    let err = engine
        .reverse_entry(ReverseEntryCommand {
            original_entry_id: deposit.entry.entry_id,
            reversed_by: user_id,
            reason: "second reversal".into(),
            idempotency_key: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::BusinessRuleFailure(BusinessRuleReason::AlreadyReversed)
    ));
}
