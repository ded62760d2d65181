//! Account record and ledger entry types shared by every store backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored `credits` value meaning "no finite cap" (plan-level unlimited).
pub const UNLIMITED_PLAN_CREDITS: i64 = -1;

/// Display stand-in reported as the remaining balance of admin accounts.
pub const UNLIMITED_CREDITS: i64 = 999_999;

/// Display stand-in reported as remaining tokens when no cap applies.
pub const UNLIMITED_TOKENS: i64 = 999_999;

// ── Role ─────────────────────────────────────────────────────────

/// Capability tag on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular metered account.
    #[default]
    User,
    /// Privileged account that bypasses every balance check.
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Unknown or missing roles are treated as unprivileged.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            _ => Self::User,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Credit policy ────────────────────────────────────────────────

/// How an account's credit balance is enforced.
///
/// Role bypass and the `-1` plan sentinel are independent capabilities.
/// Role is checked first, then the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditPolicy {
    /// Admin role: never checked, never decremented.
    RoleBypass,
    /// Plan-level unlimited (`credits == -1`): never checked, never decremented.
    UnlimitedPlan,
    /// Finite balance.
    Metered(i64),
}

// ── Account ──────────────────────────────────────────────────────

/// A row of the `profiles` table, restricted to the fields billing reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_plan")]
    pub plan: String,
    /// `None` means no monthly token cap.
    #[serde(default)]
    pub monthly_tokens_limit: Option<i64>,
    #[serde(default)]
    pub monthly_tokens_used: i64,
    #[serde(default)]
    pub total_tokens_used: i64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_plan() -> String {
    "free".to_string()
}

impl Account {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Single place where role bypass and the plan sentinel are ranked.
    pub fn credit_policy(&self) -> CreditPolicy {
        if self.is_admin() {
            CreditPolicy::RoleBypass
        } else if self.credits == UNLIMITED_PLAN_CREDITS {
            CreditPolicy::UnlimitedPlan
        } else {
            CreditPolicy::Metered(self.credits)
        }
    }

    /// Remaining balance as reported to callers.
    pub fn reported_credits(&self) -> i64 {
        match self.credit_policy() {
            CreditPolicy::RoleBypass => UNLIMITED_CREDITS,
            CreditPolicy::UnlimitedPlan => UNLIMITED_PLAN_CREDITS,
            CreditPolicy::Metered(credits) => credits,
        }
    }

    /// Whether no monthly token cap applies to this account.
    pub fn has_unlimited_tokens(&self) -> bool {
        self.is_admin() || self.monthly_tokens_limit.is_none()
    }

    /// Tokens left in the current month, floored at zero.
    pub fn remaining_tokens(&self) -> i64 {
        if self.has_unlimited_tokens() {
            return UNLIMITED_TOKENS;
        }
        self.monthly_tokens_limit
            .map_or(UNLIMITED_TOKENS, |limit| (limit - self.monthly_tokens_used).max(0))
    }
}

/// Partial update of profile fields that never touch the credit balance.
///
/// Balance changes go through the store's atomic entry points only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// `Some(None)` clears the cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_tokens_limit: Option<Option<i64>>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.plan.is_none() && self.role.is_none() && self.monthly_tokens_limit.is_none()
    }
}

/// Fields for seeding a new account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: String,
    pub email: String,
    pub credits: i64,
    pub role: Role,
    pub plan: String,
    pub monthly_tokens_limit: Option<i64>,
}

impl NewAccount {
    pub fn new(id: impl Into<String>, email: impl Into<String>, credits: i64) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            credits,
            role: Role::User,
            plan: default_plan(),
            monthly_tokens_limit: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    pub fn with_token_limit(mut self, limit: Option<i64>) -> Self {
        self.monthly_tokens_limit = limit;
        self
    }
}

// ── Ledger entries ───────────────────────────────────────────────

/// Kind of balance change recorded in the append-only ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Consume,
    Grant,
    Reset,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Grant => "grant",
            Self::Reset => "reset",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "consume" => Self::Consume,
            "reset" => Self::Reset,
            _ => Self::Grant,
        }
    }
}

/// One row of the `credit_ledger` audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub kind: EntryKind,
    /// Signed change applied to `credits` (0 for admin and unlimited-plan usage).
    pub delta: i64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub tokens: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(credits: i64, role: Role) -> Account {
        Account {
            id: "acct-1".into(),
            email: "writer@storyspark.app".into(),
            credits,
            role,
            plan: "starter".into(),
            monthly_tokens_limit: Some(1_000),
            monthly_tokens_used: 250,
            total_tokens_used: 4_000,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn role_bypass_ranks_above_plan_sentinel() {
        assert_eq!(account(-1, Role::Admin).credit_policy(), CreditPolicy::RoleBypass);
        assert_eq!(account(-1, Role::User).credit_policy(), CreditPolicy::UnlimitedPlan);
        assert_eq!(account(7, Role::User).credit_policy(), CreditPolicy::Metered(7));
    }

    #[test]
    fn reported_credits_per_policy() {
        assert_eq!(account(3, Role::Admin).reported_credits(), UNLIMITED_CREDITS);
        assert_eq!(account(-1, Role::User).reported_credits(), -1);
        assert_eq!(account(12, Role::User).reported_credits(), 12);
    }

    #[test]
    fn remaining_tokens_floors_at_zero() {
        let mut acct = account(1, Role::User);
        assert_eq!(acct.remaining_tokens(), 750);
        acct.monthly_tokens_used = 5_000;
        assert_eq!(acct.remaining_tokens(), 0);
        acct.monthly_tokens_limit = None;
        assert_eq!(acct.remaining_tokens(), UNLIMITED_TOKENS);
    }

    #[test]
    fn unknown_role_is_user() {
        assert_eq!(Role::from_str_lossy("editor"), Role::User);
        assert_eq!(Role::from_str_lossy("admin"), Role::Admin);
    }

    #[test]
    fn account_deserializes_with_missing_columns() {
        let json = r#"{"id": "abc", "credits": 4, "role": "admin"}"#;
        let acct: Account = serde_json::from_str(json).unwrap();
        assert_eq!(acct.role, Role::Admin);
        assert_eq!(acct.plan, "free");
        assert!(acct.monthly_tokens_limit.is_none());
        assert_eq!(acct.total_tokens_used, 0);
    }

    #[test]
    fn patch_skips_unset_fields() {
        let patch = AccountPatch {
            plan: Some("pro".into()),
            ..AccountPatch::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({"plan": "pro"}));
        assert!(AccountPatch::default().is_empty());
    }
}
