//! Storage seam for the credit ledger.
//!
//! Every balance mutation is a single atomic conditional update inside the
//! backend. There is no "set credits" entry point.

use super::account::{Account, AccountPatch, EntryKind, LedgerEntry};
use super::error::LedgerResult;
use async_trait::async_trait;

/// Result of an atomic decrement-if-positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Guard passed; the account as it is after the update.
    Consumed(Account),
    /// Guard failed; nothing was written.
    Insufficient,
}

/// Result of an atomic limit-guarded token increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Counters were incremented; the account after the update.
    Recorded(Account),
    /// The monthly cap would be exceeded; the account as read, unchanged.
    LimitExceeded(Account),
}

/// Durable home of account rows and the ledger trail.
///
/// Implementations must return `LedgerError::NotFound` for missing accounts,
/// including ids the backend could never store (e.g. non-uuid ids on
/// Supabase), and `LedgerError::StoreUnavailable` (with the backend's own
/// message) for anything else. Token counters saturate at `i64::MAX`.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Store name for logging.
    fn name(&self) -> &str;

    async fn get_account(&self, id: &str) -> LedgerResult<Account>;

    /// Case-insensitive lookup by email.
    async fn find_by_email(&self, email: &str) -> LedgerResult<Account>;

    /// Update non-balance profile fields.
    async fn update_account(&self, id: &str, patch: &AccountPatch) -> LedgerResult<Account>;

    /// Decrement one credit where `credits > 0`, or pass through untouched for
    /// admin and `-1` accounts. Adds `tokens` to both counters on success and
    /// appends a `consume` entry in the same unit of work.
    async fn consume_credit(&self, id: &str, tokens: i64) -> LedgerResult<ConsumeOutcome>;

    /// Add `delta` to a finite balance (clamped at zero; `-1` is preserved)
    /// and append an entry of `kind` with `reason`.
    async fn adjust_credits(
        &self,
        id: &str,
        delta: i64,
        kind: EntryKind,
        reason: &str,
    ) -> LedgerResult<Account>;

    /// Add `tokens` to both counters unless the monthly cap would be exceeded.
    async fn record_tokens(&self, id: &str, tokens: i64) -> LedgerResult<TokenOutcome>;

    /// Set every non-admin account on `plan` to `credits`. Returns rows touched.
    async fn reset_monthly_credits(&self, plan: &str, credits: i64) -> LedgerResult<u64>;

    /// Zero `monthly_tokens_used` on every account. Returns rows touched.
    async fn reset_monthly_tokens(&self) -> LedgerResult<u64>;

    /// Ledger entries for an account, newest first.
    async fn entries(&self, id: &str, limit: usize) -> LedgerResult<Vec<LedgerEntry>>;
}
