pub mod schema;

pub use schema::{Backend, Config, LedgerConfig};
