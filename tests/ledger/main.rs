mod support;

mod idempotency;
mod lock_lifecycle;
mod process_entry;
mod reconciliation;
mod reversal;
