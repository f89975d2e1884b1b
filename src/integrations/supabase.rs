//! Supabase integration.
//!
//! Implements the backend contracts over Supabase's HTTP APIs:
//! - GoTrue (`/auth/v1/*`) for sessions, sign-in, sign-up and passwords
//! - PostgREST (`/rest/v1/*`) for the `users` and `visits` tables
//! - An RPC function for the point increment, falling back to updating
//!   the `users` row when the function is not deployed
//!
//! ## Design
//! - HTTP client (reqwest) with the public anon key; row-level security
//!   applies, so authenticated calls carry the user's access token
//! - Every failure is turned into a [`RawError`] (status, service code,
//!   message) and classified once, here, before it leaves the adapter
//! - The session is persisted to `session.json` in the data directory and
//!   refreshed with its refresh token once the access token expires
//! - Session changes are announced on a broadcast channel

use crate::backend::{
    AuthBackend, AuthChange, NewProfile, PointsUpdate, Session, SignUpAttrs, User, VisitStore,
    VisitStoreError,
};
use crate::config::SupabaseConfig;
use crate::error::{classify, ClassifiedError, ErrorKind, RawError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// File holding the persisted session inside the data directory.
pub const SESSION_FILE: &str = "session.json";

/// Refresh this many seconds before the access token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Postgres `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";
/// PostgREST code for a function missing from the schema cache.
const UNDEFINED_FUNCTION: &str = "PGRST202";
const INCREMENT_POINTS_RPC: &str = "increment_visit_points";

// ── Wire models ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self, now_secs: i64) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| now_secs + self.expires_in.unwrap_or(3600));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id: self.user.id,
            email: self.user.email,
        }
    }
}

/// With email confirmation enabled GoTrue answers sign-up with the bare
/// user; otherwise it signs the new account in straight away.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    WithSession(TokenResponse),
    UserOnly(AuthUser),
}

/// Union of the error shapes GoTrue and PostgREST return.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    /// Numeric on GoTrue, a string such as `PGRST116` on PostgREST.
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn raw_error(status: u16, body: &str) -> RawError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error_code
        .or(match parsed.code {
            Some(serde_json::Value::String(code)) => Some(code),
            _ => None,
        })
        .or(parsed.error);
    let message = parsed
        .msg
        .or(parsed.message)
        .or(parsed.error_description)
        .unwrap_or_else(|| body.trim().to_string());
    RawError {
        status: Some(status),
        code,
        message,
    }
}

fn transport_error(e: &reqwest::Error) -> RawError {
    // A client-side timeout never produced a status; report it as 408 so it
    // is classified as a timeout rather than a dead network.
    let status = e.is_timeout().then_some(408);
    RawError::new(status, None, e.to_string())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Supabase client ──────────────────────────────────────────────

/// Supabase HTTP client acting as one signed-in end user.
pub struct SupabaseClient {
    config: SupabaseConfig,
    http: reqwest::Client,
    session: Mutex<Option<Session>>,
    session_path: Option<PathBuf>,
    changes: broadcast::Sender<AuthChange>,
}

impl SupabaseClient {
    /// Create a client. With a data directory, a previously persisted
    /// session is loaded and later changes are written back.
    pub fn new(config: SupabaseConfig, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        if !config.is_configured() {
            anyhow::bail!("Supabase URL and anon key must be configured");
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let session_path = data_dir.map(|dir| dir.join(SESSION_FILE));
        let session = session_path.as_deref().and_then(load_session);
        let (changes, _) = broadcast::channel(16);

        Ok(Self {
            config: SupabaseConfig {
                url: config.url.trim_end_matches('/').to_string(),
                anon_key: config.anon_key,
            },
            http,
            session: Mutex::new(session),
            session_path,
            changes,
        })
    }

    /// Build the GoTrue URL for an endpoint.
    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.config.url, endpoint)
    }

    /// Build the PostgREST URL for a table.
    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    /// Build the RPC URL for a function.
    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.config.url, function)
    }

    /// Base headers. The bearer is the user's access token when signed in,
    /// the anon key otherwise.
    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let bearer = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.config.anon_key.clone());
        vec![
            ("apikey", self.config.anon_key.clone()),
            ("Authorization", format!("Bearer {bearer}")),
        ]
    }

    fn with_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }
        request
    }

    /// Send and return the response, or the raw failure.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RawError> {
        let resp = self
            .with_headers(request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(raw_error(status, &body))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<reqwest::Response, ClassifiedError> {
        self.execute(request).await.map_err(|raw| classify(&raw, context))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
        context: &str,
    ) -> Result<T, ClassifiedError> {
        resp.json().await.map_err(|e| {
            ClassifiedError::new(ErrorKind::Unknown, context, format!("bad response body: {e}"))
        })
    }

    // ── Session handling ─────────────────────────────────────

    pub fn current_session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    fn store_session(&self, session: Option<Session>) {
        *self.session.lock() = session.clone();
        let Some(path) = self.session_path.as_deref() else {
            return;
        };
        let result = match session {
            Some(ref session) => save_session(path, session),
            None => match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist session");
        }
    }

    fn announce(&self, change: AuthChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, ClassifiedError> {
        let request = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "refresh_token")])
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        let resp = self.send(request, "refreshing session").await?;
        let token: TokenResponse = Self::json(resp, "refreshing session").await?;
        let session = token.into_session(now_secs());

        tracing::debug!(user_id = %session.user_id, "Session refreshed");
        self.store_session(Some(session.clone()));
        self.announce(AuthChange::TokenRefreshed);
        Ok(session)
    }

    async fn fetch_user_row(
        &self,
        subject_id: &str,
        context: &str,
    ) -> Result<User, ClassifiedError> {
        // Single-object responses turn "no rows" into PGRST116.
        let request = self
            .http
            .get(self.table_url("users"))
            .query(&[("id", format!("eq.{subject_id}")), ("select", "*".into())])
            .header("Accept", "application/vnd.pgrst.object+json");
        let resp = self.send(request, context).await?;
        Self::json(resp, context).await
    }

    // ── Health check ─────────────────────────────────────────

    /// Check if Supabase is reachable.
    pub async fn health_check(&self) -> bool {
        let request = self.http.get(self.auth_url("health"));
        self.execute(request).await.is_ok()
    }
}

fn load_session(path: &Path) -> Option<Session> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read persisted session");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Ignoring corrupt persisted session"
            );
            None
        }
    }
}

fn save_session(path: &Path, session: &Session) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(session)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// ── Auth backend ─────────────────────────────────────────────────

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[async_trait]
impl AuthBackend for SupabaseClient {
    async fn get_session(&self) -> Result<Option<Session>, ClassifiedError> {
        let Some(session) = self.current_session() else {
            return Ok(None);
        };
        if !session.is_expired_at(now_secs() + EXPIRY_MARGIN_SECS) {
            return Ok(Some(session));
        }

        tracing::debug!(user_id = %session.user_id, "Access token expired, refreshing");
        match self.refresh(&session.refresh_token).await {
            Ok(session) => Ok(Some(session)),
            Err(e) if matches!(
                e.kind,
                ErrorKind::InvalidCredentials | ErrorKind::PermissionDenied
            ) =>
            {
                tracing::info!("Refresh token rejected, dropping persisted session");
                self.store_session(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_profile(&self, subject_id: &str) -> Result<User, ClassifiedError> {
        self.fetch_user_row(subject_id, "fetching user profile").await
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, ClassifiedError> {
        let request = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .json(&Credentials { email, password });
        let resp = self.send(request, "signing in").await?;
        let token: TokenResponse = Self::json(resp, "signing in").await?;
        let session = token.into_session(now_secs());

        tracing::info!(user_id = %session.user_id, "Signed in");
        self.store_session(Some(session.clone()));
        self.announce(AuthChange::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attrs: &SignUpAttrs,
    ) -> Result<String, ClassifiedError> {
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "data": {
                "full_name": attrs.full_name,
                "role": attrs.role,
            },
        });
        let request = self.http.post(self.auth_url("signup")).json(&body);
        let resp = self.send(request, "signing up").await?;

        match Self::json::<SignUpResponse>(resp, "signing up").await? {
            SignUpResponse::WithSession(token) => {
                let session = token.into_session(now_secs());
                let subject_id = session.user_id.clone();
                self.store_session(Some(session.clone()));
                self.announce(AuthChange::SignedIn(session));
                Ok(subject_id)
            }
            SignUpResponse::UserOnly(user) => {
                tracing::info!(user_id = %user.id, "Account created, confirmation pending");
                Ok(user.id)
            }
        }
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<(), ClassifiedError> {
        let request = self
            .http
            .post(self.table_url("users"))
            .header("Prefer", "return=minimal")
            .json(profile);
        self.send(request, "creating user profile").await?;
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ClassifiedError> {
        let had_session = self.current_session().is_some();
        let remote = if had_session {
            let request = self.http.post(self.auth_url("logout"));
            self.send(request, "signing out").await.map(|_| ())
        } else {
            Ok(())
        };

        self.store_session(None);
        if had_session {
            self.announce(AuthChange::SignedOut);
        }

        match remote {
            // The token was already dead server-side.
            Err(e) if e.kind == ErrorKind::PermissionDenied => Ok(()),
            other => other,
        }
    }

    async fn update_password(&self, new_password: &str) -> Result<(), ClassifiedError> {
        if self.current_session().is_none() {
            return Err(ClassifiedError::new(
                ErrorKind::PermissionDenied,
                "updating password",
                "no active session",
            ));
        }
        let request = self
            .http
            .put(self.auth_url("user"))
            .json(&serde_json::json!({ "password": new_password }));
        self.send(request, "updating password").await?;
        self.announce(AuthChange::UserUpdated);
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), ClassifiedError> {
        let request = self
            .http
            .post(self.auth_url("recover"))
            .json(&serde_json::json!({ "email": email }));
        self.send(request, "sending password reset").await?;
        Ok(())
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

// ── Visit store ──────────────────────────────────────────────────

#[derive(Serialize)]
struct VisitRow<'a> {
    user_id: &'a str,
    staff_id: &'a str,
    qr_code_used: &'a str,
}

#[async_trait]
impl VisitStore for SupabaseClient {
    async fn is_signature_used(&self, signature: &str) -> Result<bool, ClassifiedError> {
        let request = self.http.get(self.table_url("visits")).query(&[
            ("qr_code_used", format!("eq.{signature}")),
            ("select", "id".into()),
            ("limit", "1".into()),
        ]);
        let resp = self.send(request, "checking QR signature").await?;
        let rows: Vec<serde_json::Value> = Self::json(resp, "checking QR signature").await?;
        Ok(!rows.is_empty())
    }

    async fn get_customer(&self, subject_id: &str) -> Result<User, ClassifiedError> {
        self.fetch_user_row(subject_id, "loading customer").await
    }

    async fn record_visit(
        &self,
        subject_id: &str,
        staff_id: &str,
        signature: &str,
    ) -> Result<(), VisitStoreError> {
        let request = self
            .http
            .post(self.table_url("visits"))
            .header("Prefer", "return=minimal")
            .json(&VisitRow {
                user_id: subject_id,
                staff_id,
                qr_code_used: signature,
            });

        match self.execute(request).await {
            Ok(_) => Ok(()),
            Err(raw) if raw.code.as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(VisitStoreError::DuplicateSignature)
            }
            Err(raw) => Err(classify(&raw, "recording visit").into()),
        }
    }

    async fn increment_points(&self, subject_id: &str) -> Result<PointsUpdate, ClassifiedError> {
        let request = self
            .http
            .post(self.rpc_url(INCREMENT_POINTS_RPC))
            .json(&serde_json::json!({ "p_user_id": subject_id }));
        let resp = match self.execute(request).await {
            Ok(resp) => resp,
            Err(raw) if raw.code.as_deref() == Some(UNDEFINED_FUNCTION) => {
                tracing::warn!(
                    function = INCREMENT_POINTS_RPC,
                    "Point RPC missing, updating the users row directly"
                );
                return self.update_points_row(subject_id).await;
            }
            Err(raw) => return Err(classify(&raw, "adding points")),
        };
        let rows: Vec<PointsUpdate> = Self::json(resp, "adding points").await?;
        first_row(rows)
    }
}

impl SupabaseClient {
    /// Read-modify-write of the counters. Not atomic: two concurrent
    /// check-ins for one customer can lose an increment.
    async fn update_points_row(&self, subject_id: &str) -> Result<PointsUpdate, ClassifiedError> {
        let customer = self.fetch_user_row(subject_id, "adding points").await?;
        let update = PointsUpdate {
            current_points: customer.current_points + 1,
            total_visits: customer.total_visits + 1,
        };
        let request = self
            .http
            .patch(self.table_url("users"))
            .query(&[("id", format!("eq.{subject_id}"))])
            .header("Prefer", "return=representation")
            .json(&update);
        let resp = self.send(request, "adding points").await?;
        let rows: Vec<PointsUpdate> = Self::json(resp, "adding points").await?;
        first_row(rows)
    }
}

fn first_row(rows: Vec<PointsUpdate>) -> Result<PointsUpdate, ClassifiedError> {
    rows.into_iter().next().ok_or_else(|| {
        ClassifiedError::new(ErrorKind::NotFound, "adding points", "customer not found")
    })
}

// ── Tests ────────────────────────────────────────────────────────
