use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use storyspark_ledger::billing::plans::find_plan;
use storyspark_ledger::billing::{AccountPatch, NewAccount, Role};
use storyspark_ledger::config::{Backend, Config};
use storyspark_ledger::{
    AccountStore, CreditLedger, SqliteAccountStore, SupabaseAccountStore, TokenMeter,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "storyspark-ledger")]
#[command(about = "Credit and token metering for StorySpark accounts")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.storyspark/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or inspect accounts
    Account {
        #[command(subcommand)]
        action: AccountCommands,
    },
    /// Can the account perform one more billable action?
    Check { account_id: String },
    /// Spend one credit
    Consume {
        account_id: String,
        /// Tokens used by the action (analytics only)
        #[arg(long, default_value = "0")]
        tokens: i64,
    },
    /// Add (or with a negative amount, remove) credits
    Grant {
        account_id: String,
        #[arg(allow_negative_numbers = true)]
        amount: i64,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Top up an account looked up by email
    GrantEmail { email: String, amount: i64 },
    /// Show the ledger trail, newest first
    History {
        account_id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Monthly token cap
    Tokens {
        #[command(subcommand)]
        action: TokenCommands,
    },
    /// Monthly resets
    Reset {
        #[command(subcommand)]
        action: ResetCommands,
    },
    /// List the configured plan catalog
    Plans,
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Create an account (SQLite backend only)
    Create {
        account_id: String,
        email: String,
        /// Starting balance (defaults to [ledger].starting_credits)
        #[arg(long, allow_negative_numbers = true)]
        credits: Option<i64>,
        #[arg(long, default_value = "free")]
        plan: String,
        #[arg(long)]
        admin: bool,
        /// Monthly token cap (defaults to the plan's)
        #[arg(long)]
        token_limit: Option<i64>,
    },
    /// Show credit state
    Show { account_id: String },
    /// Move an account to another plan
    SetPlan { account_id: String, plan: String },
}

#[derive(Subcommand)]
enum TokenCommands {
    Check { account_id: String, needed: i64 },
    Consume { account_id: String, tokens: i64 },
    Usage { account_id: String },
}

#[derive(Subcommand)]
enum ResetCommands {
    /// Restore every plan's monthly credits
    Credits,
    /// Zero monthly token counters
    Tokens,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "storyspark_ledger=debug" } else { "storyspark_ledger=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The configured store, plus the concrete SQLite handle for seeding when that is the backend.
fn open_store(config: &Config) -> Result<(Arc<dyn AccountStore>, Option<SqliteAccountStore>)> {
    let (store, sqlite) = match config.backend {
        Backend::Sqlite => {
            let sqlite = SqliteAccountStore::open_in(&config.workspace_dir)?;
            let store: Arc<dyn AccountStore> = Arc::new(sqlite.clone());
            (store, Some(sqlite))
        }
        Backend::Supabase => {
            let store: Arc<dyn AccountStore> =
                Arc::new(SupabaseAccountStore::new(config.supabase_config()?.clone())?);
            (store, None)
        }
    };
    tracing::debug!(backend = store.name(), "Account store ready");
    Ok((store, sqlite))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let (store, sqlite) = open_store(&config)?;
    let ledger = CreditLedger::new(Arc::clone(&store))
        .with_low_credit_threshold(config.ledger.low_credit_threshold);
    let meter = TokenMeter::new(Arc::clone(&store));

    match cli.command {
        Commands::Account { action } => match action {
            AccountCommands::Create {
                account_id,
                email,
                credits,
                plan,
                admin,
                token_limit,
            } => {
                let Some(sqlite) = sqlite else {
                    anyhow::bail!("account create is only supported on the sqlite backend");
                };
                let plan_limit =
                    find_plan(&config.plans, &plan).and_then(|p| p.monthly_tokens_limit);
                let role = if admin { Role::Admin } else { Role::User };
                let new = NewAccount::new(
                    account_id,
                    email,
                    credits.unwrap_or(config.ledger.starting_credits),
                )
                .with_role(role)
                .with_plan(plan)
                .with_token_limit(token_limit.or(plan_limit));

                let account = sqlite.create_account(new).await?;
                print_json(&account)?;
            }
            AccountCommands::Show { account_id } => {
                let info = ledger.info(&account_id).await?;
                print_json(&serde_json::json!({
                    "info": info,
                    "is_low_on_credits": info.is_low_on_credits(ledger.low_credit_threshold()),
                    "is_out_of_credits": info.is_out_of_credits(),
                }))?;
            }
            AccountCommands::SetPlan { account_id, plan } => {
                let catalog = find_plan(&config.plans, &plan)
                    .with_context(|| format!("Unknown plan: {plan}"))?;
                let patch = AccountPatch {
                    plan: Some(catalog.slug.clone()),
                    monthly_tokens_limit: Some(catalog.monthly_tokens_limit),
                    ..AccountPatch::default()
                };
                let account = store.update_account(&account_id, &patch).await?;
                print_json(&account)?;
            }
        },
        Commands::Check { account_id } => {
            print_json(&ledger.check_available(&account_id).await?)?;
        }
        Commands::Consume { account_id, tokens } => {
            print_json(&ledger.consume(&account_id, tokens).await?)?;
        }
        Commands::Grant {
            account_id,
            amount,
            reason,
        } => {
            print_json(&ledger.grant(&account_id, amount, &reason).await?)?;
        }
        Commands::GrantEmail { email, amount } => {
            let account_id = ledger.grant_by_email(&email, amount).await?;
            print_json(&serde_json::json!({ "account_id": account_id, "amount": amount }))?;
        }
        Commands::History { account_id, limit } => {
            print_json(&ledger.history(&account_id, limit).await?)?;
        }
        Commands::Tokens { action } => match action {
            TokenCommands::Check { account_id, needed } => {
                print_json(&meter.check_tokens(&account_id, needed).await?)?;
            }
            TokenCommands::Consume { account_id, tokens } => {
                print_json(&meter.consume_tokens(&account_id, tokens).await?)?;
            }
            TokenCommands::Usage { account_id } => {
                print_json(&meter.usage(&account_id).await?)?;
            }
        },
        Commands::Reset { action } => {
            let touched = match action {
                ResetCommands::Credits => ledger.reset_monthly_credits(&config.plans).await?,
                ResetCommands::Tokens => meter.reset_monthly_tokens().await?,
            };
            print_json(&serde_json::json!({ "accounts": touched }))?;
        }
        Commands::Plans => print_json(&config.plans)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn sqlite_backend_shares_one_store_for_seeding() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            workspace_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };

        let (store, sqlite) = open_store(&config).unwrap();
        let sqlite = sqlite.expect("sqlite backend exposes the concrete store");
        sqlite
            .create_account(NewAccount::new("u1", "u1@storyspark.app", 3))
            .await
            .unwrap();

        assert_eq!(store.name(), "sqlite");
        assert_eq!(store.get_account("u1").await.unwrap().credits, 3);
    }

    #[test]
    fn supabase_backend_has_no_seeding_store() {
        let config = Config {
            backend: Backend::Supabase,
            supabase: Some(storyspark_ledger::SupabaseConfig {
                url: "https://test.supabase.co".into(),
                service_key: "svc".into(),
            }),
            ..Config::default()
        };

        let (store, sqlite) = open_store(&config).unwrap();
        assert_eq!(store.name(), "supabase");
        assert!(sqlite.is_none());
    }
}
