//! StorySpark credit ledger.
//!
//! Meters billable content generation per account: a credit balance gated by
//! atomic conditional updates, admin and unlimited-plan bypasses, optional
//! monthly token caps, and an append-only audit trail.

pub mod billing;
pub mod config;
pub mod integrations;

pub use billing::{AccountStore, CreditLedger, LedgerError, SqliteAccountStore, TokenMeter};
pub use config::Config;
pub use integrations::{SupabaseAccountStore, SupabaseConfig};
