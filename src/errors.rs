//! Error taxonomy, §7 of the spec.
//!
//! `StoreError` is raised by C2/C3/C4/C5 (anything that talks to Postgres);
//! `EngineError` is raised by C6/C7 and embeds `BusinessRuleReason` for
//! business-rule rejections. The split mirrors the teacher's
//! `StoreError`/`APIError` layering.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("account not found")]
    AccountNotFound,
    #[error("entry not found")]
    EntryNotFound,
    #[error("lock not found")]
    LockNotFound,
    #[error("account already exists for this user_id")]
    AccountAlreadyExists,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("optimistic concurrency conflict: account was updated concurrently")]
    Conflict,
    #[error(
        "entry status cannot regress from {from:?} to {to:?}"
    )]
    StatusRegression { from: String, to: String },
    #[error("lease contention on {0}")]
    Contention(String),
    #[error("unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.is_unique_violation()
        {
            return StoreError::NotUnique(e);
        }
        StoreError::Database(e)
    }
}

/// Typed reasons a business rule rejected a command, §7.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusinessRuleReason {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("amount exceeds single-transaction limit")]
    ExceedsSingleTransactionLimit,
    #[error("amount exceeds a daily limit")]
    ExceedsDailyLimit,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("lock is not active")]
    LockNotActive,
    #[error("entry type is not reversible")]
    NonReversibleEntry,
    #[error("entry has already been reversed")]
    AlreadyReversed,
    #[error("too many active locks")]
    TooManyActiveLocks,
    #[error("currency mismatch")]
    CurrencyMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("account already exists")]
    AlreadyExists,
    #[error("account is not active")]
    AccountNotActive,
    #[error("business rule failed: {0}")]
    BusinessRuleFailure(BusinessRuleReason),
    #[error("lease contention on {0}")]
    Contention(String),
    #[error("optimistic concurrency conflict")]
    Conflict,
    #[error("command cancelled before commit")]
    Cancelled,
    #[error("storage failure")]
    StorageFailure(#[source] sqlx::Error),
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn business(reason: BusinessRuleReason) -> Self {
        EngineError::BusinessRuleFailure(reason)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AccountNotFound => EngineError::NotFound("account"),
            StoreError::EntryNotFound => EngineError::NotFound("entry"),
            StoreError::LockNotFound => EngineError::NotFound("lock"),
            StoreError::AccountAlreadyExists => EngineError::AlreadyExists,
            StoreError::Conflict => EngineError::Conflict,
            StoreError::Contention(key) => EngineError::Contention(key),
            StoreError::Database(src) | StoreError::NotUnique(src) => {
                EngineError::StorageFailure(src)
            }
            StoreError::DuplicateKey => {
                EngineError::Internal("duplicate key surfaced past idempotency guard".into())
            }
            StoreError::StatusRegression { from, to } => EngineError::Internal(format!(
                "attempted entry status regression from {from} to {to}"
            )),
            StoreError::UnexpectedError(e) => EngineError::Internal(e.to_string()),
        }
    }
}

impl From<crate::money::MoneyError> for EngineError {
    fn from(_: crate::money::MoneyError) -> Self {
        EngineError::business(BusinessRuleReason::CurrencyMismatch)
    }
}
