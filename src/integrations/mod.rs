//! External backends for the credit ledger.

pub mod supabase;

pub use supabase::{SupabaseAccountStore, SupabaseConfig};
