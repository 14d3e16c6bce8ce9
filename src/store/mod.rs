//! Persistence layer for the ledger core.
//!
//! ## Design decisions
//!
//! ### Locks are a child table, not a JSON blob
//! The spec describes Locks as "in-document" children of an Account
//! aggregate. Here that's realized as a `locks` table keyed by `account_id`,
//! loaded and returned alongside every `Account` read — the same pattern the
//! teacher uses for auction rounds as children of an auction. A `Lock` is
//! never addressed independently of its owning `Account` at the API level.
//!
//! ### Optimistic concurrency via `updated_at`
//! `AccountStore::update` compares the stored `updated_at` against the value
//! the caller loaded the aggregate at; a mismatch means someone else wrote in
//! between and the caller gets `StoreError::Conflict`.
//!
//! ### Time source dependency
//! Every function that needs "now" takes a `&TimeSource` rather than calling
//! `Timestamp::now()` directly, so tests can mock it.

pub mod account;
pub mod idempotency;
pub mod journal;
pub mod lock_lease;

pub use crate::errors::StoreError;

use jiff::Timestamp;
use jiff_sqlx::Timestamp as SqlxTs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, LockId};
use crate::money::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_status", rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl Balance {
    pub fn zero() -> Self {
        Self {
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            total: Decimal::ZERO,
        }
    }

    /// I1: total = available + locked.
    pub fn is_consistent(&self) -> bool {
        self.total == self.available + self.locked
    }

    /// I2: available >= 0 and locked >= 0.
    pub fn is_non_negative(&self) -> bool {
        self.available >= Decimal::ZERO && self.locked >= Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub single_transaction_limit: Decimal,
    pub daily_deposit: Decimal,
    pub daily_withdrawal: Decimal,
    pub monthly_volume: Decimal,
}

impl From<crate::config::DefaultLimits> for Limits {
    fn from(d: crate::config::DefaultLimits) -> Self {
        Self {
            single_transaction_limit: d.single_transaction_limit,
            daily_deposit: d.daily_deposit,
            daily_withdrawal: d.daily_withdrawal,
            monthly_volume: d.monthly_volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageToday {
    /// Days since the Unix epoch, UTC. Plain integer day bucket rather than
    /// a calendar date type, so it round-trips through a BIGINT column with
    /// no extra bridging.
    pub day: i64,
    pub deposited: Decimal,
    pub withdrawn: Decimal,
    pub count: i64,
    pub last_transaction_at: Option<Timestamp>,
}

impl UsageToday {
    pub fn fresh(day: i64) -> Self {
        Self {
            day,
            deposited: Decimal::ZERO,
            withdrawn: Decimal::ZERO,
            count: 0,
            last_transaction_at: None,
        }
    }

    pub fn epoch_day(now: Timestamp) -> i64 {
        now.as_second().div_euclid(86_400)
    }

    /// Reset the rolling counters if `now` falls on a different UTC day than
    /// the one they were last accumulated on.
    pub fn rolled_over(&self, now: Timestamp) -> Self {
        let today = Self::epoch_day(now);
        if today == self.day {
            *self
        } else {
            Self::fresh(today)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub last_reconciled_at: Option<Timestamp>,
    pub journal_count: i64,
    pub balance_hash: Option<[u8; 32]>,
    pub checksum: Option<[u8; 32]>,
}

impl Verification {
    pub fn unverified() -> Self {
        Self {
            last_reconciled_at: None,
            journal_count: 0,
            balance_hash: None,
            checksum: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "lock_status", rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    Released,
    Executed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: LockId,
    pub account_id: AccountId,
    pub reference_id: String,
    pub amount: Decimal,
    pub locked_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: LockStatus,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub user_id: crate::ids::UserId,
    pub status: AccountStatus,
    pub balance: Balance,
    pub currency: Currency,
    pub limits: Limits,
    pub usage_today: UsageToday,
    pub locks: Vec<Lock>,
    pub verification: Verification,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_activity_at: Timestamp,
}

impl Account {
    /// I3: locked balance equals the sum of active locks.
    pub fn locked_matches_active_locks(&self) -> bool {
        let sum: Decimal = self
            .locks
            .iter()
            .filter(|l| l.status == LockStatus::Active)
            .map(|l| l.amount)
            .sum();
        sum == self.balance.locked
    }

    pub fn active_lock_count(&self) -> usize {
        self.locks
            .iter()
            .filter(|l| l.status == LockStatus::Active)
            .count()
    }

    pub fn find_lock(&self, lock_id: LockId) -> Option<&Lock> {
        self.locks.iter().find(|l| l.lock_id == lock_id)
    }
}

/// Raw row shape for `accounts`, converted into `Account` once its `locks`
/// have been loaded separately (see `account::get_by_id`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AccountRow {
    pub id: AccountId,
    pub user_id: crate::ids::UserId,
    pub status: AccountStatus,
    pub available: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
    pub currency: Currency,
    pub single_transaction_limit: Decimal,
    pub daily_deposit_limit: Decimal,
    pub daily_withdrawal_limit: Decimal,
    pub monthly_volume_limit: Decimal,
    pub usage_day: i64,
    pub usage_deposited: Decimal,
    pub usage_withdrawn: Decimal,
    pub usage_count: i64,
    #[sqlx(try_from = "Option<SqlxTs>")]
    pub usage_last_transaction_at: Option<Timestamp>,
    #[sqlx(try_from = "Option<SqlxTs>")]
    pub last_reconciled_at: Option<Timestamp>,
    pub journal_count: i64,
    pub balance_hash: Option<Vec<u8>>,
    pub checksum: Option<Vec<u8>>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub last_activity_at: Timestamp,
}

impl AccountRow {
    pub(crate) fn into_account(self, locks: Vec<Lock>) -> Account {
        Account {
            id: self.id,
            user_id: self.user_id,
            status: self.status,
            balance: Balance {
                available: self.available,
                locked: self.locked,
                total: self.total,
            },
            currency: self.currency,
            limits: Limits {
                single_transaction_limit: self.single_transaction_limit,
                daily_deposit: self.daily_deposit_limit,
                daily_withdrawal: self.daily_withdrawal_limit,
                monthly_volume: self.monthly_volume_limit,
            },
            usage_today: UsageToday {
                day: self.usage_day,
                deposited: self.usage_deposited,
                withdrawn: self.usage_withdrawn,
                count: self.usage_count,
                last_transaction_at: self.usage_last_transaction_at,
            },
            locks,
            verification: Verification {
                last_reconciled_at: self.last_reconciled_at,
                journal_count: self.journal_count,
                balance_hash: self.balance_hash.and_then(|v| v.try_into().ok()),
                checksum: self.checksum.and_then(|v| v.try_into().ok()),
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LockRow {
    pub lock_id: LockId,
    pub account_id: AccountId,
    pub reference_id: String,
    pub amount: Decimal,
    #[sqlx(try_from = "SqlxTs")]
    pub locked_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub expires_at: Timestamp,
    pub status: LockStatus,
    pub reason: String,
}

impl From<LockRow> for Lock {
    fn from(r: LockRow) -> Self {
        Lock {
            lock_id: r.lock_id,
            account_id: r.account_id,
            reference_id: r.reference_id,
            amount: r.amount,
            locked_at: r.locked_at,
            expires_at: r.expires_at,
            status: r.status,
            reason: r.reason,
        }
    }
}
