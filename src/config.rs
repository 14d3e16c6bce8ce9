//! Environment-driven configuration for the ledger core.
//!
//! Loaded once at process startup and passed as an immutable value into every
//! component's constructor — nothing here is read from a global afterwards.

use jiff::Span;
use rust_decimal::Decimal;
use rust_decimal::dec;
use std::time::Duration;

use crate::money::Currency;

/// Engine-wide tunables, §6 of the spec.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease TTL for mutating commands.
    pub default_lock_timeout: Duration,
    /// Cap on Contention/Conflict retries within a single command.
    pub max_retries: u32,
    /// Base delay for the retry backoff (doubled on each attempt).
    pub retry_delay: Duration,
    /// Default TTL of a newly created order lock.
    pub lock_expiration_default: Span,
    /// Maximum number of simultaneously active locks per account.
    pub max_concurrent_locks: usize,
    /// Drift tolerance below which reconciliation is a no-op.
    pub reconciliation_threshold: Decimal,
    /// Default per-account limits applied to newly created accounts.
    pub default_limits: DefaultLimits,
    /// TTL for idempotency cache entries.
    pub idempotency_ttl: Duration,
    /// Interval between expired-lock sweeps.
    pub expired_lock_sweep_interval: Duration,
    /// Lease TTL used for the reconciliation lease.
    pub reconciliation_lease_ttl: Duration,
    /// Default currency for accounts created without an explicit one.
    pub default_currency: Currency,
}

#[derive(Debug, Clone, Copy)]
pub struct DefaultLimits {
    pub single_transaction_limit: Decimal,
    pub daily_deposit: Decimal,
    pub daily_withdrawal: Decimal,
    pub monthly_volume: Decimal,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            single_transaction_limit: dec!(10000),
            daily_deposit: dec!(25000),
            daily_withdrawal: dec!(25000),
            monthly_volume: dec!(250000),
        }
    }
}

/// Floor below which a lease TTL is rejected as misconfigured.
pub const LEASE_TTL_FLOOR: Duration = Duration::from_secs(5);

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_lock_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            lock_expiration_default: Span::new().hours(24),
            max_concurrent_locks: 50,
            reconciliation_threshold: dec!(0.01),
            default_limits: DefaultLimits::default(),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            expired_lock_sweep_interval: Duration::from_secs(60),
            reconciliation_lease_ttl: Duration::from_secs(60),
            default_currency: Currency::Usd,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let secs_var = |name: &str, default: Duration| -> Duration {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let decimal_var = |name: &str, default: Decimal| -> Decimal {
            std::env::var(name)
                .ok()
                .and_then(|v| Decimal::from_str_exact(&v).ok())
                .unwrap_or(default)
        };
        let int_var = |name: &str, default: u32| -> u32 {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };

        Self {
            default_lock_timeout: secs_var(
                "LEDGER_DEFAULT_LOCK_TIMEOUT_SECS",
                defaults.default_lock_timeout,
            ),
            max_retries: int_var("LEDGER_MAX_RETRIES", defaults.max_retries),
            retry_delay: Duration::from_millis(
                std::env::var("LEDGER_RETRY_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.retry_delay.as_millis() as u64),
            ),
            lock_expiration_default: defaults.lock_expiration_default,
            max_concurrent_locks: std::env::var("LEDGER_MAX_CONCURRENT_LOCKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_locks),
            reconciliation_threshold: decimal_var(
                "LEDGER_RECONCILIATION_THRESHOLD",
                defaults.reconciliation_threshold,
            ),
            default_limits: DefaultLimits {
                single_transaction_limit: decimal_var(
                    "LEDGER_SINGLE_TRANSACTION_LIMIT",
                    defaults.default_limits.single_transaction_limit,
                ),
                daily_deposit: decimal_var(
                    "LEDGER_DAILY_DEPOSIT_LIMIT",
                    defaults.default_limits.daily_deposit,
                ),
                daily_withdrawal: decimal_var(
                    "LEDGER_DAILY_WITHDRAWAL_LIMIT",
                    defaults.default_limits.daily_withdrawal,
                ),
                monthly_volume: decimal_var(
                    "LEDGER_MONTHLY_VOLUME_LIMIT",
                    defaults.default_limits.monthly_volume,
                ),
            },
            idempotency_ttl: secs_var(
                "LEDGER_IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl,
            ),
            expired_lock_sweep_interval: secs_var(
                "LEDGER_EXPIRED_LOCK_SWEEP_INTERVAL_SECS",
                defaults.expired_lock_sweep_interval,
            ),
            reconciliation_lease_ttl: secs_var(
                "LEDGER_RECONCILIATION_LEASE_TTL_SECS",
                defaults.reconciliation_lease_ttl,
            ),
            default_currency: defaults.default_currency,
        }
    }
}

/// Database connection and process-level configuration, analogous to the
/// teacher's `Config`. Used only during startup, not shared as app state.
pub struct Config {
    pub database_url: String,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set"),
            engine: EngineConfig::from_env(),
        }
    }
}
