//! Credit and token metering for StorySpark accounts.
//!
//! Gates billable actions (content generation) on a per-account credit
//! balance and records token usage for analytics.
//!
//! ## Design
//! - [`CreditLedger`]: check / consume / grant / info over an [`AccountStore`]
//! - [`TokenMeter`]: optional monthly token cap, independent of credits
//! - Two unlimited mechanisms: admin role bypass, then the `-1` plan sentinel
//! - All balance changes are atomic conditional updates in the store, each
//!   paired with an append-only ledger entry

pub mod account;
pub mod error;
pub mod ledger;
pub mod meter;
pub mod plans;
pub mod sqlite;
pub mod store;

pub use account::{Account, AccountPatch, EntryKind, LedgerEntry, NewAccount, Role};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{Availability, Consumption, CreditLedger, CreditsInfo, Grant};
pub use meter::{TokenAvailability, TokenConsumption, TokenMeter, TokenUsage};
pub use plans::{default_plans, Plan};
pub use sqlite::SqliteAccountStore;
pub use store::{AccountStore, ConsumeOutcome, TokenOutcome};
