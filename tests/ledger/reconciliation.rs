use ledger_core::engine::{ProcessEntryCommand, TransactionEngine};
use ledger_core::ids::UserId;
use ledger_core::money::Currency;
use ledger_core::reconciliation::{IntegrityStatus, ReconcileOutcome, ReconciliationEngine};
use ledger_core::store::journal::{EntryType, Reference};
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
async fn reconcile_with_no_drift_is_verified_and_stamps_checksums() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(30);

    let account = engine
        .create_account(user_id, dec!(0), Currency::Usd)
        .await
        .unwrap();
    engine
        .process_entry(ProcessEntryCommand {
            account_id: account.id,
            user_id,
            entry_type: EntryType::Deposit,
            amount: dec!(42.00),
            fee: dec!(0),
            currency: Currency::Usd,
            reference: reference(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    let reconciliation = ReconciliationEngine::new(
        ctx.pool.clone(),
        ctx.time_source.clone(),
        ctx.config.clone(),
        TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone()),
    );

    let outcome = reconciliation.reconcile(account.id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Verified);

    let status = reconciliation.verify_integrity(account.id).await.unwrap();
    assert_eq!(status, IntegrityStatus::Verified);
}

#[tokio::test]
async fn drift_beyond_threshold_posts_an_adjustment_entry() {
    let ctx = TestContext::new().await;
    let engine = TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone());
    let user_id = UserId(31);

    let account = engine
        .create_account(user_id, dec!(100.00), Currency::Usd)
        .await
        .unwrap();

    // Simulate external drift directly against storage, bypassing the
    // engine, the way a bug or an out-of-band admin fix might.
    sqlx::query("UPDATE accounts SET available = available + 5, total = total + 5 WHERE id = $1")
        .bind(account.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let reconciliation = ReconciliationEngine::new(
        ctx.pool.clone(),
        ctx.time_source.clone(),
        ctx.config.clone(),
        TransactionEngine::new(ctx.pool.clone(), ctx.time_source.clone(), ctx.config.clone()),
    );

    let outcome = reconciliation.reconcile(account.id).await.unwrap();
    match outcome {
        ReconcileOutcome::Adjusted { drift } => assert_eq!(drift, dec!(-5.00)),
        ReconcileOutcome::Verified => panic!("expected drift to be detected"),
    }

    let entries =
        ledger_core::store::journal::list_all_for_account(account.id, &ctx.pool)
            .await
            .unwrap();
    assert!(entries
        .iter()
        .any(|e| e.entry_type == EntryType::Adjustment));
}
