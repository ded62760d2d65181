//! Monthly token meter.
//!
//! Token counters are analytics for the credit ledger, but plans may also
//! carry a monthly token cap. This meter enforces that cap with its own
//! guarded update and never touches `credits`.

use super::account::{Role, UNLIMITED_TOKENS};
use super::error::{LedgerError, LedgerResult};
use super::store::{AccountStore, TokenOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whether an account can spend `needed` more tokens this month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAvailability {
    pub available: bool,
    pub remaining: i64,
}

/// Result of recording token usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConsumption {
    pub remaining: i64,
}

/// Usage snapshot for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub monthly_used: i64,
    pub monthly_limit: Option<i64>,
    pub total_used: i64,
    /// `None` when no cap applies; otherwise matches `check_tokens`.
    pub remaining: Option<i64>,
    /// Rounded percentage of the cap used; 0 without a cap, 100 for a zero cap.
    pub usage_percentage: i64,
    pub is_unlimited: bool,
    pub plan: String,
    pub role: Role,
}

pub struct TokenMeter {
    store: Arc<dyn AccountStore>,
}

impl TokenMeter {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    pub async fn check_tokens(&self, account_id: &str, needed: i64) -> LedgerResult<TokenAvailability> {
        let account = self.store.get_account(account_id).await?;
        if account.has_unlimited_tokens() {
            return Ok(TokenAvailability {
                available: true,
                remaining: UNLIMITED_TOKENS,
            });
        }

        let remaining = account.remaining_tokens();
        Ok(TokenAvailability {
            available: remaining >= needed,
            remaining,
        })
    }

    pub async fn consume_tokens(&self, account_id: &str, tokens: i64) -> LedgerResult<TokenConsumption> {
        match self.store.record_tokens(account_id, tokens.max(0)).await? {
            TokenOutcome::Recorded(account) => {
                let remaining = account.remaining_tokens();
                tracing::debug!(
                    account_id,
                    tokens,
                    monthly_used = account.monthly_tokens_used,
                    remaining,
                    "Tokens recorded"
                );
                Ok(TokenConsumption { remaining })
            }
            TokenOutcome::LimitExceeded(account) => {
                let remaining = account.remaining_tokens();
                tracing::info!(account_id, tokens, remaining, "Token usage blocked: monthly limit");
                Err(LedgerError::TokenLimitExceeded { remaining })
            }
        }
    }

    pub async fn usage(&self, account_id: &str) -> LedgerResult<TokenUsage> {
        let account = self.store.get_account(account_id).await?;
        let (remaining, usage_percentage) = match account.monthly_tokens_limit {
            Some(limit) if !account.has_unlimited_tokens() => {
                let percentage = if limit > 0 {
                    (account.monthly_tokens_used as f64 / limit as f64 * 100.0).round() as i64
                } else {
                    100
                };
                (Some(account.remaining_tokens()), percentage)
            }
            _ => (None, 0),
        };

        Ok(TokenUsage {
            monthly_used: account.monthly_tokens_used,
            monthly_limit: account.monthly_tokens_limit,
            total_used: account.total_tokens_used,
            remaining,
            usage_percentage,
            is_unlimited: account.has_unlimited_tokens(),
            plan: account.plan,
            role: account.role,
        })
    }

    /// Zero every account's monthly counter. Lifetime totals are kept.
    pub async fn reset_monthly_tokens(&self) -> LedgerResult<u64> {
        let touched = self.store.reset_monthly_tokens().await?;
        tracing::info!(accounts = touched, "Monthly token counters reset");
        Ok(touched)
    }
}
