//! On-disk configuration for the ledger CLI.
//!
//! ```toml
//! backend = "sqlite"
//! workspace_dir = "/var/lib/storyspark"
//!
//! [ledger]
//! low_credit_threshold = 5
//! starting_credits = 5
//!
//! [supabase]
//! url = "https://xxxx.supabase.co"
//! service_key = "..."
//!
//! [[plans]]
//! slug = "pro"
//! name = "Pro"
//! monthly_credits = 500
//! ```

use crate::billing::ledger::DEFAULT_LOW_CREDIT_THRESHOLD;
use crate::billing::plans::{default_plans, Plan};
use crate::integrations::supabase::SupabaseConfig;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which account store the CLI talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Supabase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Finite balances at or below this are "low".
    #[serde(default = "default_low_credit_threshold")]
    pub low_credit_threshold: i64,
    /// Balance given to accounts created from the CLI.
    #[serde(default = "default_starting_credits")]
    pub starting_credits: i64,
}

fn default_low_credit_threshold() -> i64 {
    DEFAULT_LOW_CREDIT_THRESHOLD
}

fn default_starting_credits() -> i64 {
    5
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            low_credit_threshold: default_low_credit_threshold(),
            starting_credits: default_starting_credits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path the config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Directory holding `ledger.db` for the SQLite backend.
    #[serde(default)]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub supabase: Option<SupabaseConfig>,
    #[serde(default = "default_plans")]
    pub plans: Vec<Plan>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            workspace_dir: PathBuf::new(),
            backend: Backend::default(),
            ledger: LedgerConfig::default(),
            supabase: None,
            plans: default_plans(),
        }
    }
}

/// `~/.storyspark`
pub fn default_base_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".storyspark"))
}

impl Config {
    /// Load from `path`, or `~/.storyspark/config.toml` when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base_dir = default_base_dir()?;

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = base_dir.join("config.toml");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self {
                        config_path: default_path,
                        ..Self::default()
                    }
                }
            }
        };

        if config.workspace_dir.as_os_str().is_empty() {
            config.workspace_dir = base_dir.join("workspace");
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// `SUPABASE_URL` / `SUPABASE_SERVICE_KEY` replace the file's `[supabase]` table.
    fn apply_env_overrides(&mut self) {
        if let Some(env) = SupabaseConfig::from_env() {
            self.supabase = Some(env);
        }
    }

    /// Supabase settings, required when `backend = "supabase"`.
    pub fn supabase_config(&self) -> Result<&SupabaseConfig> {
        self.supabase.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "backend is supabase but no [supabase] section or SUPABASE_URL/SUPABASE_SERVICE_KEY set"
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend, Backend::Sqlite);
        assert_eq!(config.ledger.low_credit_threshold, 5);
        assert_eq!(config.ledger.starting_credits, 5);
        assert!(config.supabase.is_none());
        assert_eq!(config.plans.len(), 4);
    }

    #[test]
    fn full_config_deserialization() {
        let toml_str = r#"
backend = "supabase"
workspace_dir = "/tmp/storyspark"

[ledger]
low_credit_threshold = 10

[supabase]
url = "https://test.supabase.co"
service_key = "svc"

[[plans]]
slug = "enterprise"
name = "Enterprise"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend, Backend::Supabase);
        assert_eq!(config.workspace_dir, PathBuf::from("/tmp/storyspark"));
        assert_eq!(config.ledger.low_credit_threshold, 10);
        assert_eq!(config.ledger.starting_credits, 5);
        assert_eq!(config.supabase.unwrap().url, "https://test.supabase.co");
        assert_eq!(config.plans.len(), 1);
        assert!(config.plans[0].is_unlimited());
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!(toml::from_str::<Config>(r#"backend = "redis""#).is_err());
    }

    #[test]
    fn load_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.toml");
        std::fs::write(&path, "[ledger]\nstarting_credits = 20\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.config_path, path);
        assert_eq!(config.ledger.starting_credits, 20);
        assert!(config.workspace_dir.ends_with("workspace"));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(Some(&tmp.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn supabase_required_for_supabase_backend() {
        let config = Config {
            backend: Backend::Supabase,
            ..Config::default()
        };
        assert!(config.supabase_config().is_err());
    }
}
