//! Contracts the core expects from the hosted backend.
//!
//! Two seams: [`AuthBackend`] for identity (sessions, sign-in, profile rows)
//! and [`VisitStore`] for check-in bookkeeping. Implementations classify
//! every failure into a [`ClassifiedError`] before returning it.

use crate::error::ClassifiedError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ── Profiles ─────────────────────────────────────────────────────

/// Account role stored on the profile row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile row from the `users` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Same id as the auth subject.
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    /// Points not yet spent on rewards.
    pub current_points: u32,
    /// Lifetime number of recorded visits.
    pub total_visits: u32,
    pub created_at: DateTime<Utc>,
}

/// Row inserted right after sign-up. Counters start at zero and
/// `created_at` is filled in by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProfile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub current_points: u32,
    pub total_visits: u32,
}

impl NewProfile {
    pub fn new(id: &str, email: &str, attrs: &SignUpAttrs) -> Self {
        Self {
            id: id.to_string(),
            email: email.trim().to_string(),
            full_name: attrs.full_name.trim().to_string(),
            role: attrs.role,
            current_points: 0,
            total_visits: 0,
        }
    }
}

/// Extra attributes collected at sign-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpAttrs {
    pub full_name: String,
    pub role: Role,
}

// ── Sessions ─────────────────────────────────────────────────────

/// An authenticated session held by the auth service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds) when the access token expires.
    pub expires_at: i64,
    /// The auth subject, equal to the profile row id.
    pub user_id: String,
    pub email: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        now_secs >= self.expires_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Notification pushed by the auth service when the session changes
/// outside of the current call flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChange {
    SignedIn(Session),
    SignedOut,
    /// The user followed a password-recovery link.
    PasswordRecovery,
    UserUpdated,
    TokenRefreshed,
}

// ── Auth backend ─────────────────────────────────────────────────

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Return the persisted session, if any.
    async fn get_session(&self) -> Result<Option<Session>, ClassifiedError>;

    /// Fetch the profile row for `subject_id`. Missing rows are `NotFound`.
    async fn get_profile(&self, subject_id: &str) -> Result<User, ClassifiedError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, ClassifiedError>;

    /// Create an account. Returns the new subject id.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attrs: &SignUpAttrs,
    ) -> Result<String, ClassifiedError>;

    async fn insert_profile(&self, profile: &NewProfile) -> Result<(), ClassifiedError>;

    async fn sign_out(&self) -> Result<(), ClassifiedError>;

    async fn update_password(&self, new_password: &str) -> Result<(), ClassifiedError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), ClassifiedError>;

    /// Subscribe to session changes. Dropping the receiver unsubscribes.
    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange>;
}

// ── Visit store ──────────────────────────────────────────────────

/// Counters after a successful check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsUpdate {
    pub current_points: u32,
    pub total_visits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VisitStoreError {
    /// The signature is already recorded against an earlier visit.
    #[error("QR signature already recorded against a visit")]
    DuplicateSignature,
    #[error(transparent)]
    Backend(#[from] ClassifiedError),
}

#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Whether a visit already carries this QR signature.
    async fn is_signature_used(&self, signature: &str) -> Result<bool, ClassifiedError>;

    /// Profile row of the customer named by a token.
    async fn get_customer(&self, subject_id: &str) -> Result<User, ClassifiedError>;

    /// Insert a visit row. The store must reject a reused signature with
    /// [`VisitStoreError::DuplicateSignature`].
    async fn record_visit(
        &self,
        subject_id: &str,
        staff_id: &str,
        signature: &str,
    ) -> Result<(), VisitStoreError>;

    /// Add one point and one visit to the customer's counters.
    async fn increment_points(&self, subject_id: &str) -> Result<PointsUpdate, ClassifiedError>;
}
