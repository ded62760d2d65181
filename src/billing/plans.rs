//! Subscription plan catalog used by the monthly credit reset.

use super::account::UNLIMITED_PLAN_CREDITS;
use serde::{Deserialize, Serialize};

/// A subscription plan and the allowance it restores each month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Matches `Account::plan`.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Credits granted each month. `None` = unlimited.
    #[serde(default)]
    pub monthly_credits: Option<i64>,
    /// Monthly token cap. `None` = no cap.
    #[serde(default)]
    pub monthly_tokens_limit: Option<i64>,
}

impl Plan {
    fn builtin(slug: &str, name: &str, credits: i64, tokens: i64) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            monthly_credits: Some(credits),
            monthly_tokens_limit: Some(tokens),
        }
    }

    /// Value written to `credits` on reset (`-1` for unlimited plans).
    pub fn reset_credits(&self) -> i64 {
        self.monthly_credits.unwrap_or(UNLIMITED_PLAN_CREDITS)
    }

    pub fn is_unlimited(&self) -> bool {
        self.monthly_credits.is_none()
    }
}

/// Built-in catalog used when the config declares no `[[plans]]`.
pub fn default_plans() -> Vec<Plan> {
    vec![
        Plan::builtin("free", "Free", 5, 50_000),
        Plan::builtin("starter", "Starter", 100, 500_000),
        Plan::builtin("pro", "Pro", 500, 2_500_000),
        Plan::builtin("business", "Business", 2_000, 10_000_000),
    ]
}

/// Look up a plan by slug, ignoring case.
pub fn find_plan<'a>(plans: &'a [Plan], slug: &str) -> Option<&'a Plan> {
    plans.iter().find(|p| p.slug.eq_ignore_ascii_case(slug))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_defined() {
        let plans = default_plans();
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[0].slug, "free");
        assert_eq!(plans[3].reset_credits(), 2_000);
    }

    #[test]
    fn find_plan_ignores_case() {
        let plans = default_plans();
        assert_eq!(find_plan(&plans, "PRO").unwrap().monthly_credits, Some(500));
        assert!(find_plan(&plans, "enterprise").is_none());
    }

    #[test]
    fn unlimited_plan_resets_to_sentinel() {
        let plan: Plan = toml::from_str(
            r#"
slug = "enterprise"
name = "Enterprise"
"#,
        )
        .unwrap();
        assert!(plan.is_unlimited());
        assert_eq!(plan.reset_credits(), -1);
        assert!(plan.monthly_tokens_limit.is_none());
    }
}
