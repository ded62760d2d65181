//! Typed outcomes for ledger and store operations.

use thiserror::Error;

/// Every failure a ledger operation can report.
///
/// `InsufficientCredits` and `TokenLimitExceeded` are expected business
/// outcomes; the rest are propagated for the caller to render.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("insufficient credits (remaining {remaining})")]
    InsufficientCredits { remaining: i64 },

    #[error("monthly token limit exceeded (remaining {remaining})")]
    TokenLimitExceeded { remaining: i64 },

    #[error("credit amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    /// Underlying store message, passed through verbatim.
    #[error("{0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    /// Whether this is an expected outcome rather than a fault.
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredits { .. } | Self::TokenLimitExceeded { .. } | Self::InvalidAmount(_)
        )
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(e: r2d2::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
