//! SQLite-backed account store.
//!
//! Tables:
//! - `profiles`: one row per account (credits, role, plan, token counters)
//! - `credit_ledger`: append-only trail, one row per balance change
//!
//! Every mutation runs in an `IMMEDIATE` transaction whose first statement
//! is the guarded `UPDATE ... RETURNING`, so concurrent consumers serialise
//! on SQLite's write lock and the guard is evaluated against committed state.

use super::account::{Account, AccountPatch, EntryKind, LedgerEntry, NewAccount, Role};
use super::error::{LedgerError, LedgerResult};
use super::store::{AccountStore, ConsumeOutcome, TokenOutcome};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// Database file name inside the workspace directory.
pub const LEDGER_DB_FILE: &str = "ledger.db";

/// Pool size. Writers still serialise on SQLite's lock.
const MAX_POOL_SIZE: u32 = 8;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const ACCOUNT_COLUMNS: &str = "id, email, credits, role, plan, monthly_tokens_limit, \
     monthly_tokens_used, total_tokens_used, updated_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL DEFAULT '',
        credits INTEGER NOT NULL DEFAULT 0 CHECK (credits >= -1),
        role TEXT NOT NULL DEFAULT 'user',
        plan TEXT NOT NULL DEFAULT 'free',
        monthly_tokens_limit INTEGER,
        monthly_tokens_used INTEGER NOT NULL DEFAULT 0,
        total_tokens_used INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_profiles_email ON profiles(email COLLATE NOCASE);
    CREATE INDEX IF NOT EXISTS idx_profiles_plan ON profiles(plan);

    CREATE TABLE IF NOT EXISTS credit_ledger (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        delta INTEGER NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        tokens INTEGER NOT NULL DEFAULT 0,
        balance_after INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_ledger_account ON credit_ledger(account_id);";

/// Account store over a pooled SQLite database in WAL mode.
#[derive(Clone)]
pub struct SqliteAccountStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAccountStore {
    /// Open (or create) `ledger.db` inside the workspace directory.
    pub fn open_in(workspace_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(workspace_dir).with_context(|| {
            format!("Failed to create workspace dir: {}", workspace_dir.display())
        })?;
        Self::open(&workspace_dir.join(LEDGER_DB_FILE))
    }

    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });

        let pool = Pool::builder()
            .max_size(MAX_POOL_SIZE)
            .build(manager)
            .with_context(|| format!("Failed to open ledger DB: {}", db_path.display()))?;

        pool.get()?
            .execute_batch(SCHEMA)
            .context("Failed to create ledger schema")?;

        tracing::debug!(path = %db_path.display(), "Ledger store opened");
        Ok(Self { pool })
    }

    /// Insert a new account row. Signup normally owns this; used for seeding.
    pub async fn create_account(&self, new: NewAccount) -> LedgerResult<Account> {
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO profiles (id, email, credits, role, plan, monthly_tokens_limit, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.id,
                    new.email,
                    new.credits,
                    new.role.as_str(),
                    new.plan,
                    new.monthly_tokens_limit,
                    now_millis(),
                ],
            );

            match result {
                Ok(_) => fetch_account(conn, &new.id),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(LedgerError::StoreUnavailable(format!(
                        "account '{}' already exists or has invalid credits",
                        new.id
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Run blocking SQLite work off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> LedgerResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LedgerError::StoreUnavailable(format!("ledger store task failed: {e}")))?
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_account(&self, id: &str) -> LedgerResult<Account> {
        let id = id.to_string();
        self.with_conn(move |conn| fetch_account(conn, &id)).await
    }

    async fn find_by_email(&self, email: &str) -> LedgerResult<Account> {
        let email = email.trim().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM profiles WHERE email = ?1 COLLATE NOCASE LIMIT 1"
                ),
                params![email],
                account_from_row,
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(email.clone()))
        })
        .await
    }

    async fn update_account(&self, id: &str, patch: &AccountPatch) -> LedgerResult<Account> {
        if patch.is_empty() {
            return self.get_account(id).await;
        }
        let id = id.to_string();
        let plan = patch.plan.clone();
        let role = patch.role.map(Role::as_str);
        let set_limit = patch.monthly_tokens_limit.is_some();
        let limit = patch.monthly_tokens_limit.flatten();

        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "UPDATE profiles SET
                        plan = COALESCE(?2, plan),
                        role = COALESCE(?3, role),
                        monthly_tokens_limit = CASE WHEN ?4 THEN ?5 ELSE monthly_tokens_limit END,
                        updated_at = ?6
                     WHERE id = ?1
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![id, plan, role, set_limit, limit, now_millis()],
                account_from_row,
            )
            .optional()?
            .ok_or_else(|| LedgerError::NotFound(id.clone()))
        })
        .await
    }

    async fn consume_credit(&self, id: &str, tokens: i64) -> LedgerResult<ConsumeOutcome> {
        let id = id.to_string();
        let tokens = tokens.max(0);

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let updated = tx
                .query_row(
                    &format!(
                        "UPDATE profiles SET
                            credits = CASE WHEN role = 'admin' OR credits = -1
                                           THEN credits ELSE credits - 1 END,
                            monthly_tokens_used = {monthly},
                            total_tokens_used = {total},
                            updated_at = ?3
                         WHERE id = ?1 AND (role = 'admin' OR credits = -1 OR credits > 0)
                         RETURNING {ACCOUNT_COLUMNS}",
                        monthly = saturating_add("monthly_tokens_used", "?2"),
                        total = saturating_add("total_tokens_used", "?2"),
                    ),
                    params![id, tokens, now_millis()],
                    account_from_row,
                )
                .optional()?;

            let Some(account) = updated else {
                let exists = tx
                    .query_row("SELECT 1 FROM profiles WHERE id = ?1", params![id], |_| Ok(()))
                    .optional()?
                    .is_some();
                return if exists {
                    Ok(ConsumeOutcome::Insufficient)
                } else {
                    Err(LedgerError::NotFound(id))
                };
            };

            let delta = if account.is_admin() || account.credits == -1 { 0 } else { -1 };
            insert_entry(&tx, &account, EntryKind::Consume, delta, "", tokens)?;
            tx.commit()?;

            Ok(ConsumeOutcome::Consumed(account))
        })
        .await
    }

    async fn adjust_credits(
        &self,
        id: &str,
        delta: i64,
        kind: EntryKind,
        reason: &str,
    ) -> LedgerResult<Account> {
        let id = id.to_string();
        let reason = reason.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // The IMMEDIATE lock is held, so this read cannot go stale before the update.
            let before: i64 = tx
                .query_row("SELECT credits FROM profiles WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or_else(|| LedgerError::NotFound(id.clone()))?;

            let account = tx.query_row(
                &format!(
                    "UPDATE profiles SET
                        credits = CASE WHEN credits = -1 THEN -1 ELSE MAX(credits + ?2, 0) END,
                        updated_at = ?3
                     WHERE id = ?1
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![id, delta, now_millis()],
                account_from_row,
            )?;

            let applied = if before == -1 { 0 } else { account.credits - before };
            insert_entry(&tx, &account, kind, applied, &reason, 0)?;
            tx.commit()?;

            Ok(account)
        })
        .await
    }

    async fn record_tokens(&self, id: &str, tokens: i64) -> LedgerResult<TokenOutcome> {
        let id = id.to_string();
        let tokens = tokens.max(0);

        self.with_conn(move |conn| {
            let updated = conn
                .query_row(
                    &format!(
                        "UPDATE profiles SET
                            monthly_tokens_used = {monthly},
                            total_tokens_used = {total},
                            updated_at = ?3
                         WHERE id = ?1
                           AND (role = 'admin'
                                OR monthly_tokens_limit IS NULL
                                OR ?2 <= monthly_tokens_limit - monthly_tokens_used)
                         RETURNING {ACCOUNT_COLUMNS}",
                        monthly = saturating_add("monthly_tokens_used", "?2"),
                        total = saturating_add("total_tokens_used", "?2"),
                    ),
                    params![id, tokens, now_millis()],
                    account_from_row,
                )
                .optional()?;

            match updated {
                Some(account) => Ok(TokenOutcome::Recorded(account)),
                None => fetch_account(conn, &id).map(TokenOutcome::LimitExceeded),
            }
        })
        .await
    }

    async fn reset_monthly_credits(&self, plan: &str, credits: i64) -> LedgerResult<u64> {
        let plan = plan.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let previous: Vec<(String, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, credits FROM profiles WHERE plan = ?1 AND role != 'admin'",
                )?;
                let rows = stmt.query_map(params![plan], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let collected = rows.collect::<Result<Vec<_>, _>>()?;
                collected
            };

            let touched = tx.execute(
                "UPDATE profiles SET credits = ?2, updated_at = ?3
                 WHERE plan = ?1 AND role != 'admin'",
                params![plan, credits, now_millis()],
            )?;

            let reason = format!("monthly reset ({plan})");
            for (id, before) in previous {
                let delta = if before == -1 || credits == -1 { 0 } else { credits - before };
                let account = fetch_account(&tx, &id)?;
                insert_entry(&tx, &account, EntryKind::Reset, delta, &reason, 0)?;
            }
            tx.commit()?;

            Ok(touched as u64)
        })
        .await
    }

    async fn reset_monthly_tokens(&self) -> LedgerResult<u64> {
        self.with_conn(|conn| {
            let touched = conn.execute(
                "UPDATE profiles SET monthly_tokens_used = 0, updated_at = ?1",
                params![now_millis()],
            )?;
            Ok(touched as u64)
        })
        .await
    }

    async fn entries(&self, id: &str, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        let id = id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, kind, delta, reason, tokens, balance_after, created_at
                 FROM credit_ledger WHERE account_id = ?1
                 ORDER BY rowid DESC LIMIT ?2",
            )?;

            let entries = stmt
                .query_map(params![id, limit], |row| {
                    let kind: String = row.get(2)?;
                    Ok(LedgerEntry {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        kind: EntryKind::from_str_lossy(&kind),
                        delta: row.get(3)?,
                        reason: row.get(4)?,
                        tokens: row.get(5)?,
                        balance_after: row.get(6)?,
                        created_at: from_millis(row.get(7)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(entries)
        })
        .await
    }
}

fn fetch_account(conn: &Connection, id: &str) -> LedgerResult<Account> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM profiles WHERE id = ?1"),
        params![id],
        account_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound(id.to_string()))
}

fn insert_entry(
    conn: &Connection,
    account: &Account,
    kind: EntryKind,
    delta: i64,
    reason: &str,
    tokens: i64,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO credit_ledger (id, account_id, kind, delta, reason, tokens, balance_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            uuid::Uuid::new_v4().to_string(),
            account.id,
            kind.as_str(),
            delta,
            reason,
            tokens,
            account.credits,
            now_millis(),
        ],
    )?;
    Ok(())
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let role: String = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        email: row.get(1)?,
        credits: row.get(2)?,
        role: Role::from_str_lossy(&role),
        plan: row.get(4)?,
        monthly_tokens_limit: row.get(5)?,
        monthly_tokens_used: row.get(6)?,
        total_tokens_used: row.get(7)?,
        updated_at: from_millis(row.get(8)?),
    })
}

/// `column + param` capped at `i64::MAX`; SQLite would otherwise overflow to REAL.
/// `param` must be non-negative.
fn saturating_add(column: &str, param: &str) -> String {
    format!(
        "CASE WHEN {column} > {max} - {param} THEN {max} ELSE {column} + {param} END",
        max = i64::MAX
    )
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
