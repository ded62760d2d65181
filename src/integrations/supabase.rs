//! Supabase account store for StorySpark.
//!
//! Talks to the hosted project's PostgREST and RPC endpoints:
//! - `profiles` table for account reads and non-balance profile updates
//! - `credit_ledger` table for the audit trail
//! - RPC functions (`consume_credit`, `adjust_credits`, `record_tokens`,
//!   `reset_monthly_credits_by_plan`, `reset_monthly_tokens`) for every
//!   balance mutation, so each one is a single guarded `UPDATE` in Postgres
//!
//! ## Design
//! - HTTP client (reqwest) with service-key authentication (server-side only)
//! - Non-2xx responses surface the response body verbatim as `StoreUnavailable`
//! - An empty RPC result means the guard rejected the update; one follow-up
//!   read tells "insufficient" apart from "not found"

use crate::billing::account::{Account, AccountPatch, EntryKind, LedgerEntry, Role};
use crate::billing::error::{LedgerError, LedgerResult};
use crate::billing::store::{AccountStore, ConsumeOutcome, TokenOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// SQL migration defining the ledger table and RPC functions this store calls.
pub const LEDGER_MIGRATION_SQL: &str =
    include_str!("../../supabase/migrations/20250610120000_credit_ledger.sql");

const PROFILE_COLUMNS: &str = "id,email,credits,role,plan,monthly_tokens_limit,\
     monthly_tokens_used,total_tokens_used,updated_at";

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Rows fetched for an email lookup before exact matching.
const EMAIL_CANDIDATE_LIMIT: usize = 10;

// ── Configuration ────────────────────────────────────────────────

/// Supabase connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Supabase project URL (e.g., https://xxxx.supabase.co).
    pub url: String,
    /// Supabase service role key (server-side, never exposed to client).
    pub service_key: String,
}

impl SupabaseConfig {
    /// Load from environment variables.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_KEY").ok()?;

        if url.is_empty() || service_key.is_empty() {
            return None;
        }

        Some(Self { url, service_key })
    }
}

// ── Row models ───────────────────────────────────────────────────

/// `profiles` row as PostgREST returns it; most columns are nullable.
#[derive(Debug, Clone, Deserialize)]
struct ProfileRow {
    id: String,
    email: Option<String>,
    credits: Option<i64>,
    role: Option<String>,
    plan: Option<String>,
    monthly_tokens_limit: Option<i64>,
    monthly_tokens_used: Option<i64>,
    total_tokens_used: Option<i64>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<ProfileRow> for Account {
    fn from(row: ProfileRow) -> Self {
        Self {
            id: row.id,
            email: row.email.unwrap_or_default(),
            credits: row.credits.unwrap_or(0),
            role: row.role.as_deref().map_or(Role::User, Role::from_str_lossy),
            plan: row.plan.unwrap_or_else(|| "free".to_string()),
            monthly_tokens_limit: row.monthly_tokens_limit,
            monthly_tokens_used: row.monthly_tokens_used.unwrap_or(0),
            total_tokens_used: row.total_tokens_used.unwrap_or(0),
            updated_at: row.updated_at.unwrap_or_else(Utc::now),
        }
    }
}

fn first_account(rows: Vec<ProfileRow>) -> Option<Account> {
    rows.into_iter().next().map(Account::from)
}

/// `profiles.id` is a uuid column; anything else cannot name an account.
fn check_account_id(id: &str) -> LedgerResult<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| LedgerError::NotFound(id.to_string()))
}

/// Escape ILIKE metacharacters so an email matches literally.
fn escape_ilike(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ── Store ────────────────────────────────────────────────────────

/// Account store backed by a Supabase project.
pub struct SupabaseAccountStore {
    config: SupabaseConfig,
    http: reqwest::Client,
}

impl SupabaseAccountStore {
    /// Create a new Supabase store.
    pub fn new(config: SupabaseConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self { config, http })
    }

    /// Build the PostgREST URL for a table.
    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url.trim_end_matches('/'), table)
    }

    /// Build the RPC URL for a function.
    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.config.url.trim_end_matches('/'), function)
    }

    /// Get the base headers for authenticated requests.
    fn auth_headers(&self) -> Vec<(&str, String)> {
        vec![
            ("apikey", self.config.service_key.clone()),
            (
                "Authorization",
                format!("Bearer {}", self.config.service_key),
            ),
        ]
    }

    /// Send an authenticated request and decode the JSON body.
    async fn send<T: DeserializeOwned>(&self, mut request: reqwest::RequestBuilder) -> LedgerResult<T> {
        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }

        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!("Supabase request failed ({status}): {body}");
            return Err(LedgerError::StoreUnavailable(if body.is_empty() {
                status.to_string()
            } else {
                body
            }));
        }

        Ok(resp.json().await?)
    }

    async fn rpc<T: DeserializeOwned>(&self, function: &str, payload: serde_json::Value) -> LedgerResult<T> {
        self.send(self.http.post(self.rpc_url(function)).json(&payload))
            .await
    }

    async fn select_profiles(
        &self,
        filter: (&str, String),
        limit: usize,
    ) -> LedgerResult<Vec<ProfileRow>> {
        let limit = limit.to_string();
        let request = self.http.get(self.table_url("profiles")).query(&[
            (filter.0, filter.1.as_str()),
            ("select", PROFILE_COLUMNS),
            ("order", "id.asc"),
            ("limit", limit.as_str()),
        ]);
        self.send(request).await
    }
}

#[async_trait]
impl AccountStore for SupabaseAccountStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn get_account(&self, id: &str) -> LedgerResult<Account> {
        check_account_id(id)?;
        let rows = self.select_profiles(("id", format!("eq.{id}")), 1).await?;
        first_account(rows).ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn find_by_email(&self, email: &str) -> LedgerResult<Account> {
        let email = email.trim().to_lowercase();
        let rows = self
            .select_profiles(
                ("email", format!("ilike.{}", escape_ilike(&email))),
                EMAIL_CANDIDATE_LIMIT,
            )
            .await?;

        // `*` is still a PostgREST wildcard, so only an exact match counts.
        rows.into_iter()
            .map(Account::from)
            .find(|account| account.email.trim().eq_ignore_ascii_case(&email))
            .ok_or_else(|| LedgerError::NotFound(email.clone()))
    }

    async fn update_account(&self, id: &str, patch: &AccountPatch) -> LedgerResult<Account> {
        if patch.is_empty() {
            return self.get_account(id).await;
        }
        check_account_id(id)?;
        let mut body = serde_json::to_value(patch)
            .map_err(|e| LedgerError::StoreUnavailable(e.to_string()))?;
        body["updated_at"] = serde_json::json!(Utc::now());

        let request = self
            .http
            .patch(self.table_url("profiles"))
            .query(&[("id", format!("eq.{id}")), ("select", PROFILE_COLUMNS.to_string())])
            .header("Prefer", "return=representation")
            .json(&body);

        let rows: Vec<ProfileRow> = self.send(request).await?;
        first_account(rows).ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn consume_credit(&self, id: &str, tokens: i64) -> LedgerResult<ConsumeOutcome> {
        check_account_id(id)?;
        let rows: Vec<ProfileRow> = self
            .rpc(
                "consume_credit",
                serde_json::json!({ "p_account_id": id, "p_tokens": tokens }),
            )
            .await?;

        match first_account(rows) {
            Some(account) => Ok(ConsumeOutcome::Consumed(account)),
            None => {
                // Guard rejected the update or the row is missing.
                self.get_account(id).await?;
                Ok(ConsumeOutcome::Insufficient)
            }
        }
    }

    async fn adjust_credits(
        &self,
        id: &str,
        delta: i64,
        kind: EntryKind,
        reason: &str,
    ) -> LedgerResult<Account> {
        check_account_id(id)?;
        let rows: Vec<ProfileRow> = self
            .rpc(
                "adjust_credits",
                serde_json::json!({
                    "p_account_id": id,
                    "p_delta": delta,
                    "p_kind": kind.as_str(),
                    "p_reason": reason,
                }),
            )
            .await?;

        first_account(rows).ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn record_tokens(&self, id: &str, tokens: i64) -> LedgerResult<TokenOutcome> {
        check_account_id(id)?;
        let rows: Vec<ProfileRow> = self
            .rpc(
                "record_tokens",
                serde_json::json!({ "p_account_id": id, "p_tokens": tokens }),
            )
            .await?;

        match first_account(rows) {
            Some(account) => Ok(TokenOutcome::Recorded(account)),
            None => self.get_account(id).await.map(TokenOutcome::LimitExceeded),
        }
    }

    async fn reset_monthly_credits(&self, plan: &str, credits: i64) -> LedgerResult<u64> {
        self.rpc(
            "reset_monthly_credits_by_plan",
            serde_json::json!({ "p_plan": plan, "p_credits": credits }),
        )
        .await
    }

    async fn reset_monthly_tokens(&self) -> LedgerResult<u64> {
        self.rpc("reset_monthly_tokens", serde_json::json!({})).await
    }

    async fn entries(&self, id: &str, limit: usize) -> LedgerResult<Vec<LedgerEntry>> {
        if check_account_id(id).is_err() {
            return Ok(Vec::new());
        }
        let request = self.http.get(self.table_url("credit_ledger")).query(&[
            ("account_id", format!("eq.{id}")),
            ("order", "created_at.desc".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.send(request).await
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> SupabaseConfig {
        SupabaseConfig {
            url: "https://test-project.supabase.co".into(),
            service_key: "test-service-key".into(),
        }
    }

    const ACCOUNT_ID: &str = "2b7c0c9e-0000-4000-8000-000000000001";
    const GHOST_ID: &str = "2b7c0c9e-0000-4000-8000-0000000000ff";

    fn profile_json(credits: i64, role: &str) -> serde_json::Value {
        serde_json::json!([{
            "id": ACCOUNT_ID,
            "email": "writer@storyspark.app",
            "credits": credits,
            "role": role,
            "plan": "starter",
            "monthly_tokens_limit": null,
            "monthly_tokens_used": 120,
            "total_tokens_used": 900,
            "updated_at": "2025-06-10T12:00:00Z"
        }])
    }

    fn mock_store(server: &MockServer) -> SupabaseAccountStore {
        SupabaseAccountStore::new(SupabaseConfig {
            url: server.uri(),
            service_key: "test-service-key".into(),
        })
        .unwrap()
    }

    async fn mount_rpc(server: &MockServer, function: &str, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(format!("/rest/v1/rpc/{function}")))
            .respond_with(response)
            .mount(server)
            .await;
    }

    async fn mount_profiles(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn table_url_construction() {
        let store = SupabaseAccountStore::new(test_config()).unwrap();
        assert_eq!(
            store.table_url("profiles"),
            "https://test-project.supabase.co/rest/v1/profiles"
        );
    }

    #[test]
    fn rpc_url_construction_trims_trailing_slash() {
        let store = SupabaseAccountStore::new(SupabaseConfig {
            url: "https://test-project.supabase.co/".into(),
            service_key: "k".into(),
        })
        .unwrap();
        assert_eq!(
            store.rpc_url("consume_credit"),
            "https://test-project.supabase.co/rest/v1/rpc/consume_credit"
        );
    }

    #[test]
    fn auth_headers_contain_key() {
        let store = SupabaseAccountStore::new(test_config()).unwrap();
        let headers = store.auth_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "apikey");
        assert_eq!(headers[0].1, "test-service-key");
        assert!(headers[1].1.starts_with("Bearer "));
    }

    #[test]
    fn profile_row_tolerates_nulls() {
        let json = r#"[{"id": "abc", "credits": null, "role": null, "plan": null}]"#;
        let rows: Vec<ProfileRow> = serde_json::from_str(json).unwrap();
        let account = first_account(rows).unwrap();
        assert_eq!(account.credits, 0);
        assert_eq!(account.role, Role::User);
        assert_eq!(account.plan, "free");
        assert_eq!(account.monthly_tokens_used, 0);
    }

    #[test]
    fn ledger_entry_deserialization() {
        let json = r#"[{
            "id": "e1", "account_id": "abc", "kind": "grant", "delta": 10,
            "reason": "promo", "tokens": 0, "balance_after": 10,
            "created_at": "2025-06-10T12:00:00Z"
        }]"#;
        let entries: Vec<LedgerEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].kind, EntryKind::Grant);
        assert_eq!(entries[0].balance_after, 10);
    }

    #[test]
    fn migration_guards_consume_with_single_update() {
        assert!(LEDGER_MIGRATION_SQL.contains("function public.consume_credit"));
        assert!(LEDGER_MIGRATION_SQL
            .contains("and (role = 'admin' or credits = -1 or credits > 0)"));
        assert!(LEDGER_MIGRATION_SQL.contains("function public.reset_monthly_credits_by_plan"));
        assert!(LEDGER_MIGRATION_SQL.contains("create table if not exists public.credit_ledger"));
        assert!(LEDGER_MIGRATION_SQL
            .contains("monthly_tokens_used = public.saturating_token_add(monthly_tokens_used, spent)"));
    }

    #[tokio::test]
    async fn consume_returns_updated_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/consume_credit"))
            .and(wiremock::matchers::header("apikey", "test-service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_json(4, "user")))
            .mount(&server)
            .await;
        let store = mock_store(&server);

        match store.consume_credit(ACCOUNT_ID, 10).await.unwrap() {
            ConsumeOutcome::Consumed(account) => {
                assert_eq!(account.credits, 4);
                assert_eq!(account.total_tokens_used, 900);
            }
            ConsumeOutcome::Insufficient => panic!("expected a consumed row"),
        }
    }

    #[tokio::test]
    async fn empty_consume_with_existing_profile_is_insufficient() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "consume_credit",
            ResponseTemplate::new(200).set_body_json(serde_json::json!([])),
        )
        .await;
        mount_profiles(&server, profile_json(0, "user")).await;
        let store = mock_store(&server);

        assert_eq!(
            store.consume_credit(ACCOUNT_ID, 0).await.unwrap(),
            ConsumeOutcome::Insufficient
        );
    }

    #[tokio::test]
    async fn empty_consume_without_profile_is_not_found() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "consume_credit",
            ResponseTemplate::new(200).set_body_json(serde_json::json!([])),
        )
        .await;
        mount_profiles(&server, serde_json::json!([])).await;
        let store = mock_store(&server);

        assert_eq!(
            store.consume_credit(GHOST_ID, 0).await.unwrap_err(),
            LedgerError::NotFound(GHOST_ID.into())
        );
    }

    #[tokio::test]
    async fn find_by_email_uses_case_insensitive_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .and(query_param("email", "ilike.writer@storyspark.app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_json(3, "user")))
            .mount(&server)
            .await;
        let store = mock_store(&server);

        let account = store.find_by_email(" Writer@StorySpark.app ").await.unwrap();
        assert_eq!(account.credits, 3);
    }

    #[tokio::test]
    async fn find_by_email_escapes_wildcards_and_requires_exact_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .and(query_param("email", r"ilike.a\_b@x.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": GHOST_ID, "email": "axb@x.com", "credits": 1 },
                { "id": ACCOUNT_ID, "email": "A_B@x.com", "credits": 7 }
            ])))
            .mount(&server)
            .await;
        let store = mock_store(&server);

        let account = store.find_by_email("a_b@x.com").await.unwrap();
        assert_eq!(account.id, ACCOUNT_ID);
        assert_eq!(account.credits, 7);
    }

    #[tokio::test]
    async fn find_by_email_ignores_wildcard_only_matches() {
        let server = MockServer::start().await;
        mount_profiles(
            &server,
            serde_json::json!([{ "id": GHOST_ID, "email": "a%b@x.com", "credits": 1 }]),
        )
        .await;
        let store = mock_store(&server);

        assert_eq!(
            store.find_by_email("a*b@x.com").await.unwrap_err(),
            LedgerError::NotFound("a*b@x.com".into())
        );
    }

    #[test]
    fn escape_ilike_escapes_metacharacters() {
        assert_eq!(escape_ilike(r"50%_off\x"), r"50\%\_off\\x");
        assert_eq!(escape_ilike("plain@x.com"), "plain@x.com");
    }

    #[tokio::test]
    async fn malformed_account_id_is_not_found_without_a_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .expect(0)
            .mount(&server)
            .await;
        let store = mock_store(&server);

        assert_eq!(
            store.consume_credit("not-a-uuid", 0).await.unwrap_err(),
            LedgerError::NotFound("not-a-uuid".into())
        );
        assert_eq!(
            store.get_account("ghost").await.unwrap_err(),
            LedgerError::NotFound("ghost".into())
        );
        assert!(matches!(
            store.adjust_credits("1", 5, EntryKind::Grant, "promo").await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            store.record_tokens("x", 5).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(store.entries("x", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_error_body_is_passed_through() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "adjust_credits",
            ResponseTemplate::new(503).set_body_string(r#"{"message":"connection pool exhausted"}"#),
        )
        .await;
        let store = mock_store(&server);

        let err = store
            .adjust_credits(ACCOUNT_ID, 5, EntryKind::Grant, "promo")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::StoreUnavailable(r#"{"message":"connection pool exhausted"}"#.into())
        );
    }

    #[tokio::test]
    async fn reset_rpc_returns_row_count() {
        let server = MockServer::start().await;
        mount_rpc(
            &server,
            "reset_monthly_credits_by_plan",
            ResponseTemplate::new(200).set_body_json(serde_json::json!(12)),
        )
        .await;
        let store = mock_store(&server);

        assert_eq!(store.reset_monthly_credits("pro", 500).await.unwrap(), 12);
    }
}
