use ledger_core::engine::TransactionEngine;
use ledger_core::reconciliation::ReconciliationEngine;
use ledger_core::scheduler::Scheduler;
use ledger_core::telemetry::{get_subscriber, init_subscriber};
use ledger_core::time::TimeSource;
use ledger_core::Config;

/// Ledger core service.
///
/// Environment variables can be set directly or loaded from a .env file in
/// the project root.
///
/// Required:
/// - DATABASE_URL: PostgreSQL connection string
///
/// Optional (documented defaults in `config.rs`):
/// - LEDGER_DEFAULT_LOCK_TIMEOUT_SECS, LEDGER_MAX_RETRIES, LEDGER_RETRY_DELAY_MS
/// - LEDGER_MAX_CONCURRENT_LOCKS, LEDGER_RECONCILIATION_THRESHOLD
/// - LEDGER_SINGLE_TRANSACTION_LIMIT, LEDGER_DAILY_DEPOSIT_LIMIT,
///   LEDGER_DAILY_WITHDRAWAL_LIMIT, LEDGER_MONTHLY_VOLUME_LIMIT
/// - LEDGER_IDEMPOTENCY_TTL_SECS, LEDGER_EXPIRED_LOCK_SWEEP_INTERVAL_SECS
/// - LEDGER_RECONCILIATION_LEASE_TTL_SECS
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let subscriber = get_subscriber("info".into());
    init_subscriber(subscriber);

    let config = Config::from_env();

    let pool = sqlx::PgPool::connect(&config.database_url).await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run database migrations");

    #[cfg(not(feature = "mock-time"))]
    let time_source = TimeSource::new();
    #[cfg(feature = "mock-time")]
    let time_source = TimeSource::new(jiff::Timestamp::now());

    // `engine` is what a request-handling layer (out of scope here) would
    // hold onto to serve commands; this binary only runs the background
    // maintenance loop.
    let engine = TransactionEngine::new(pool.clone(), time_source.clone(), config.engine.clone());
    let reconciliation = ReconciliationEngine::new(
        pool.clone(),
        time_source.clone(),
        config.engine.clone(),
        engine,
    );

    let scheduler = Scheduler::new(
        pool.clone(),
        time_source.clone(),
        reconciliation,
        config.engine.expired_lock_sweep_interval,
        100,
    );

    tracing::info!("ledger core started");
    scheduler.run().await;
    Ok(())
}
