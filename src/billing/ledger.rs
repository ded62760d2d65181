//! Credit ledger: availability checks, consumption, and grants.
//!
//! The ledger never reads a balance and writes it back. Every mutation is
//! delegated to one atomic entry point on the [`AccountStore`], so two
//! concurrent consumers of the same account cannot both spend its last credit.

use super::account::{Account, CreditPolicy, EntryKind, LedgerEntry, Role, UNLIMITED_CREDITS};
use super::error::{LedgerError, LedgerResult};
use super::plans::Plan;
use super::store::{AccountStore, ConsumeOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default balance at or below which an account is flagged as low.
pub const DEFAULT_LOW_CREDIT_THRESHOLD: i64 = 5;

/// Answer to "can this account perform one more billable action?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    pub remaining: i64,
}

/// Result of a successful consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumption {
    pub remaining: i64,
}

/// Result of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub new_balance: i64,
}

/// Read-only projection of an account's credit state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditsInfo {
    pub current_credits: i64,
    /// Role-level bypass (admin).
    pub is_unlimited: bool,
    /// Plan-level sentinel (`credits == -1`).
    pub has_unlimited_plan: bool,
    pub plan: String,
    pub role: Role,
    pub monthly_tokens_used: i64,
    pub total_tokens_used: i64,
}

impl CreditsInfo {
    fn from_account(account: &Account) -> Self {
        let is_unlimited = account.is_admin();
        Self {
            current_credits: if is_unlimited { UNLIMITED_CREDITS } else { account.credits },
            is_unlimited,
            has_unlimited_plan: account.credits == -1,
            plan: account.plan.clone(),
            role: account.role,
            monthly_tokens_used: account.monthly_tokens_used,
            total_tokens_used: account.total_tokens_used,
        }
    }

    fn is_capped(&self) -> bool {
        !self.is_unlimited && !self.has_unlimited_plan
    }

    pub fn is_low_on_credits(&self, threshold: i64) -> bool {
        self.is_capped() && self.current_credits <= threshold
    }

    pub fn is_out_of_credits(&self) -> bool {
        self.is_capped() && self.current_credits <= 0
    }
}

/// Per-account credit ledger over a pluggable store.
pub struct CreditLedger {
    store: Arc<dyn AccountStore>,
    low_credit_threshold: i64,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            low_credit_threshold: DEFAULT_LOW_CREDIT_THRESHOLD,
        }
    }

    /// Set the balance at or below which `is_low` reports true.
    pub fn with_low_credit_threshold(mut self, threshold: i64) -> Self {
        self.low_credit_threshold = threshold;
        self
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn low_credit_threshold(&self) -> i64 {
        self.low_credit_threshold
    }

    /// Whether the account can perform one more billable action. Read-only.
    pub async fn check_available(&self, account_id: &str) -> LedgerResult<Availability> {
        let account = self.store.get_account(account_id).await?;
        let availability = match account.credit_policy() {
            CreditPolicy::RoleBypass | CreditPolicy::UnlimitedPlan => Availability {
                available: true,
                remaining: account.reported_credits(),
            },
            CreditPolicy::Metered(credits) => Availability {
                available: credits > 0,
                remaining: credits,
            },
        };
        Ok(availability)
    }

    /// Spend one credit. `tokens_for_logging` only feeds the usage counters.
    pub async fn consume(
        &self,
        account_id: &str,
        tokens_for_logging: i64,
    ) -> LedgerResult<Consumption> {
        let outcome = self
            .store
            .consume_credit(account_id, tokens_for_logging.max(0))
            .await
            .inspect_err(|e| log_failure("consume", account_id, e))?;

        match outcome {
            ConsumeOutcome::Consumed(account) => {
                let remaining = account.reported_credits();
                tracing::info!(
                    account_id,
                    remaining,
                    tokens = tokens_for_logging,
                    "Credit consumed"
                );
                Ok(Consumption { remaining })
            }
            ConsumeOutcome::Insufficient => {
                tracing::info!(account_id, "Consume blocked: insufficient credits");
                Err(LedgerError::InsufficientCredits { remaining: 0 })
            }
        }
    }

    /// Add `amount` credits (negative amounts deduct, floored at zero).
    pub async fn grant(&self, account_id: &str, amount: i64, reason: &str) -> LedgerResult<Grant> {
        let account = self
            .store
            .adjust_credits(account_id, amount, EntryKind::Grant, reason)
            .await
            .inspect_err(|e| log_failure("grant", account_id, e))?;

        tracing::info!(
            account_id,
            amount,
            reason,
            new_balance = account.credits,
            "Credits granted"
        );
        Ok(Grant {
            new_balance: account.credits,
        })
    }

    /// Operator top-up by email. Returns the account id that was credited.
    pub async fn grant_by_email(&self, email: &str, amount: i64) -> LedgerResult<String> {
        if amount <= 0 {
            let err = LedgerError::InvalidAmount(amount);
            log_failure("grant_by_email", email, &err);
            return Err(err);
        }
        let account = self.store.find_by_email(email).await?;
        self.grant(&account.id, amount, &format!("top-up for {}", email.trim()))
            .await?;
        Ok(account.id)
    }

    /// Pure projection of the account's credit state.
    pub async fn info(&self, account_id: &str) -> LedgerResult<CreditsInfo> {
        let account = self.store.get_account(account_id).await?;
        Ok(CreditsInfo::from_account(&account))
    }

    /// Whether the account is at or below the configured low-balance threshold.
    pub async fn is_low(&self, account_id: &str) -> LedgerResult<bool> {
        Ok(self
            .info(account_id)
            .await?
            .is_low_on_credits(self.low_credit_threshold))
    }

    /// Raw stored `credits` value, sentinel included.
    pub async fn balance(&self, account_id: &str) -> LedgerResult<i64> {
        Ok(self.store.get_account(account_id).await?.credits)
    }

    /// Ledger trail for an account, newest first.
    pub async fn history(&self, account_id: &str, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.entries(account_id, limit).await
    }

    /// Restore each plan's monthly allowance on its non-admin accounts.
    pub async fn reset_monthly_credits(&self, plans: &[Plan]) -> LedgerResult<u64> {
        let mut total = 0;
        for plan in plans {
            let touched = self
                .store
                .reset_monthly_credits(&plan.slug, plan.reset_credits())
                .await?;
            tracing::debug!(
                plan = %plan.slug,
                unlimited = plan.is_unlimited(),
                touched,
                "Plan credits reset"
            );
            total += touched;
        }
        tracing::info!(accounts = total, "Monthly credits reset");
        Ok(total)
    }
}

fn log_failure(op: &str, account_id: &str, err: &LedgerError) {
    if err.is_business_outcome() {
        tracing::info!(account_id, op, "Ledger operation declined: {err}");
        return;
    }
    match err {
        LedgerError::StoreUnavailable(msg) => {
            tracing::error!(account_id, op, "Ledger store failure: {msg}");
        }
        other => tracing::debug!(account_id, op, "Ledger operation rejected: {other}"),
    }
}
