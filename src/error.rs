//! Backend error taxonomy.
//!
//! Every remote call made against the hosted backend is classified exactly
//! once, at the adapter boundary, into an [`ErrorKind`]. Everything above the
//! adapter (the auth state machine, the check-in flow, the CLI) branches on
//! the kind only and never looks at raw status codes or response bodies.
//!
//! ## Classification order
//! 1. Auth service codes and messages (credentials, confirmation, signup)
//! 2. Storage codes (`PGRST116` not found, `42501` row-level security)
//! 3. Rate limiting and timeouts
//! 4. Missing status → transport failure
//! 5. HTTP status families (401/403/406, 404, 5xx)
//! 6. Everything else → `Unknown`

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Error kinds ──────────────────────────────────────────────────

/// Fixed set of failure classes the core is allowed to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Wrong email or password.
    InvalidCredentials,
    /// Account exists but the confirmation link was never followed.
    EmailNotConfirmed,
    /// Sign-up for an email that already has an account.
    AlreadyRegistered,
    /// The auth service refuses new registrations.
    SignupDisabled,
    /// Authorization failure, including row-level security rejections.
    PermissionDenied,
    /// Profile or session row missing.
    NotFound,
    /// Network or connectivity failure before a response arrived.
    Transport,
    /// 5xx-class failure on the backend.
    Server,
    /// A bounded operation exceeded its budget.
    Timeout,
    /// Too many requests.
    RateLimited,
    /// Anything not covered above.
    Unknown,
}

/// How loudly a failure should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::EmailNotConfirmed => "email_not_confirmed",
            Self::AlreadyRegistered => "already_registered",
            Self::SignupDisabled => "signup_disabled",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Transport => "transport",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }

    /// Message safe to show to the person in front of the screen.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::InvalidCredentials => {
                "Invalid email or password. Please check your credentials and try again."
            }
            Self::EmailNotConfirmed => {
                "Please check your email and click the confirmation link before signing in."
            }
            Self::AlreadyRegistered => {
                "An account with this email already exists. Please sign in instead."
            }
            Self::SignupDisabled => {
                "Account registration is currently disabled. Please contact support."
            }
            Self::PermissionDenied => {
                "We're having trouble with your account permissions. Please contact support."
            }
            Self::NotFound => "User profile not found. Please contact support.",
            Self::Transport => {
                "We're having trouble connecting to our servers. Please check your internet connection."
            }
            Self::Server => {
                "Our servers are temporarily unavailable. Please try again in a few minutes."
            }
            Self::Timeout => "Connection timed out. Please check your internet connection.",
            Self::RateLimited => "Too many requests. Please wait a moment before trying again.",
            Self::Unknown => "An unexpected error occurred. Please try again.",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::InvalidCredentials | Self::EmailNotConfirmed | Self::AlreadyRegistered => {
                Severity::Low
            }
            Self::SignupDisabled | Self::NotFound | Self::RateLimited | Self::Unknown => {
                Severity::Medium
            }
            Self::Transport | Self::Timeout => Severity::High,
            Self::PermissionDenied | Self::Server => Severity::Critical,
        }
    }

    /// Whether waiting and trying again has a reasonable chance of success.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Server | Self::Timeout | Self::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Classified error ─────────────────────────────────────────────

/// A backend failure after classification.
///
/// `Clone` so the same failure can be handed to every waiter of a shared
/// bootstrap and stored in the published session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} while {context}: {detail}")]
pub struct ClassifiedError {
    /// The classified failure class.
    pub kind: ErrorKind,
    /// What the core was doing ("getting session", "signing in", ...).
    pub context: String,
    /// Technical detail for logs. Never shown to users verbatim.
    pub detail: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// A bounded operation ran past its budget.
    pub fn timeout(context: impl Into<String>, budget: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            context,
            format!("timed out after {}ms", budget.as_millis()),
        )
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

// ── Raw backend errors ───────────────────────────────────────────

/// Unclassified failure as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawError {
    /// HTTP status, `None` when no response arrived.
    pub status: Option<u16>,
    /// Service-specific error code (`invalid_credentials`, `PGRST116`, `42501`, ...).
    pub code: Option<String>,
    /// Human-readable message from the service or transport.
    pub message: String,
}

impl RawError {
    pub fn new(status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Map a raw backend failure into the taxonomy.
pub fn classify(raw: &RawError, context: &str) -> ClassifiedError {
    let kind = classify_kind(raw);
    let detail = match (raw.status, raw.code.as_deref()) {
        (Some(status), Some(code)) => format!("[{status} {code}] {}", raw.message),
        (Some(status), None) => format!("[{status}] {}", raw.message),
        (None, Some(code)) => format!("[{code}] {}", raw.message),
        (None, None) => raw.message.clone(),
    };

    tracing::debug!(
        context = context,
        kind = kind.as_str(),
        status = ?raw.status,
        code = ?raw.code,
        "Classified backend error"
    );

    ClassifiedError::new(kind, context, detail)
}

fn classify_kind(raw: &RawError) -> ErrorKind {
    let message = raw.message.to_lowercase();
    let code = raw.code.as_deref().unwrap_or("");

    if code == "invalid_credentials"
        || code == "invalid_grant"
        || message.contains("invalid login credentials")
    {
        return ErrorKind::InvalidCredentials;
    }
    if code == "email_not_confirmed" || message.contains("email not confirmed") {
        return ErrorKind::EmailNotConfirmed;
    }
    if code == "user_already_exists"
        || code == "email_exists"
        || message.contains("user already registered")
    {
        return ErrorKind::AlreadyRegistered;
    }
    if code == "signup_disabled" || message.contains("signups not allowed") {
        return ErrorKind::SignupDisabled;
    }

    if code == "PGRST116" {
        return ErrorKind::NotFound;
    }
    if code == "42501" || message.contains("row-level security") {
        return ErrorKind::PermissionDenied;
    }

    if raw.status == Some(429)
        || code == "over_request_rate_limit"
        || message.contains("rate limit")
    {
        return ErrorKind::RateLimited;
    }
    if raw.status == Some(408) || message.contains("timeout") || message.contains("timed out") {
        return ErrorKind::Timeout;
    }

    match raw.status {
        None | Some(0) => ErrorKind::Transport,
        Some(401 | 403 | 406) => ErrorKind::PermissionDenied,
        Some(404) => ErrorKind::NotFound,
        Some(500..=599) => ErrorKind::Server,
        Some(_) => ErrorKind::Unknown,
    }
}

// ── Tests ────────────────────────────────────────────────────────
