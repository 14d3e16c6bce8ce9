use ledger_core::engine::CommandResult;
use ledger_core::ids::IdempotencyKey;
use ledger_core::store::idempotency;
use ledger_core::store::journal::{
    Amount, BalanceSnapshot, EntryStatus, EntryType, Processing, Reference, ReversalInfo,
};
use rust_decimal::dec;
use std::time::Duration;

use crate::support::TestContext;

fn sample_result(ctx: &TestContext) -> CommandResult {
    let now = ctx.time_source.now();
    CommandResult {
        entry: ledger_core::store::journal::Entry {
            entry_id: ledger_core::ids::EntryId::new(),
            account_id: ledger_core::ids::AccountId::new(),
            user_id: ledger_core::ids::UserId(1),
            entry_type: EntryType::Deposit,
            status: EntryStatus::Completed,
            amount: Amount {
                value: dec!(10),
                fee: dec!(0),
                net: dec!(10),
                currency: ledger_core::money::Currency::Usd,
            },
            balance_snapshot: Some(BalanceSnapshot::default()),
            reference: Reference::default(),
            idempotency_key: None,
            processing: Processing::default(),
            reversal: ReversalInfo::default(),
            created_at: now,
            updated_at: now,
        },
        lock_id: None,
        expires_at: None,
        idempotent_replay: false,
    }
}

#[tokio::test]
async fn cache_miss_then_hit_round_trips_the_same_result() {
    let ctx = TestContext::new().await;
    let key = IdempotencyKey::new("cache-test-1");

    let (_, hit) = idempotency::get(&key, &ctx.time_source, &ctx.pool).await.unwrap();
    assert!(!hit);

    let result = sample_result(&ctx);
    idempotency::set(&key, &result, Duration::from_secs(60), &ctx.time_source, &ctx.pool).await;

    let (cached, hit) = idempotency::get(&key, &ctx.time_source, &ctx.pool).await.unwrap();
    assert!(hit);
    assert_eq!(cached.unwrap().entry.entry_id, result.entry.entry_id);
}

#[tokio::test]
async fn expired_entries_are_pruned() {
    let ctx = TestContext::new().await;
    let key = IdempotencyKey::new("cache-test-2");
    let result = sample_result(&ctx);

    idempotency::set(
        &key,
        &result,
        Duration::from_secs(1),
        &ctx.time_source,
        &ctx.pool,
    )
    .await;

    ctx.time_source.advance(jiff::Span::new().seconds(2));
    let pruned = idempotency::prune_expired(&ctx.time_source, &ctx.pool)
        .await
        .unwrap();
    assert_eq!(pruned, 1);

    let (_, hit) = idempotency::get(&key, &ctx.time_source, &ctx.pool).await.unwrap();
    assert!(!hit);
}
