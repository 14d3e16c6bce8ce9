//! Id type wrappers help ensure we don't mix up ids for different tables.
//!
//! Display is derived to make it easier to log events with the id.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UserId(pub i64);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct LockId(pub Uuid);

impl LockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-supplied idempotency key. Opaque beyond uniqueness.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}
