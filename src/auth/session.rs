//! Authentication state snapshots.
//!
//! [`AuthSession`] is immutable from the outside: every transition consumes
//! the previous snapshot and returns the next one. The state machine is the
//! only caller of these transitions; observers receive clones over a
//! `watch` channel.

use crate::backend::User;
use crate::error::ClassifiedError;

/// Where the bootstrap currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Resolving whether anyone is signed in.
    #[default]
    Initializing,
    /// Resolved. `AuthSession::user` says who, if anyone.
    Ready,
    /// The last bootstrap attempt failed and is waiting for `retry()`.
    Retrying,
    /// Retry budget spent. Credentials were cleared; restart the shell.
    ExhaustedRetries,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Retrying => "retrying",
            Self::ExhaustedRetries => "exhausted_retries",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthSession {
    pub user: Option<User>,
    pub phase: Phase,
    /// Explicit retries consumed since the last fresh start.
    pub retry_count: u32,
    pub last_error: Option<ClassifiedError>,
    /// A user-initiated action is in flight.
    pub busy: bool,
    /// The auth service reported a password-recovery sign-in.
    pub password_recovery: bool,
}

impl AuthSession {
    pub fn initializing() -> Self {
        Self::default()
    }

    /// A bootstrap attempt is starting.
    pub fn loading(self) -> Self {
        Self {
            phase: Phase::Initializing,
            last_error: None,
            ..self
        }
    }

    pub fn ready(self, user: Option<User>) -> Self {
        Self {
            user,
            phase: Phase::Ready,
            last_error: None,
            busy: false,
            ..self
        }
    }

    /// A bootstrap attempt failed.
    pub fn retrying(self, error: ClassifiedError) -> Self {
        Self {
            user: None,
            phase: Phase::Retrying,
            last_error: Some(error),
            busy: false,
            ..self
        }
    }

    /// Consume one retry and start another attempt.
    pub fn retry_attempt(self) -> Self {
        Self {
            phase: Phase::Initializing,
            retry_count: self.retry_count + 1,
            last_error: None,
            ..self
        }
    }

    pub fn exhausted(self, error: Option<ClassifiedError>) -> Self {
        Self {
            user: None,
            phase: Phase::ExhaustedRetries,
            last_error: error.or(self.last_error),
            busy: false,
            password_recovery: false,
            ..self
        }
    }

    /// Explicit sign-out: nobody is signed in and the slate is clean.
    pub fn signed_out(self) -> Self {
        Self {
            phase: Phase::Ready,
            ..Self::default()
        }
    }

    pub fn busy(self) -> Self {
        Self {
            busy: true,
            last_error: None,
            ..self
        }
    }

    pub fn idle(self) -> Self {
        Self {
            busy: false,
            ..self
        }
    }

    /// A user action failed. The retry counter is left alone.
    pub fn failed_action(self, error: ClassifiedError) -> Self {
        Self {
            busy: false,
            last_error: Some(error),
            ..self
        }
    }

    /// Apply a user change pushed by the auth service.
    pub fn with_user(self, user: Option<User>) -> Self {
        Self { user, ..self }
    }

    pub fn with_password_recovery(self, active: bool) -> Self {
        Self {
            password_recovery: active,
            ..self
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Whether the retry affordance should be offered.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.phase == Phase::Retrying && self.retry_count < max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::customer;

    fn err(kind: ErrorKind) -> ClassifiedError {
        ClassifiedError::new(kind, "testing", "detail")
    }

    #[test]
    fn starts_initializing() {
        let s = AuthSession::initializing();
        assert_eq!(s.phase, Phase::Initializing);
        assert_eq!(s.retry_count, 0);
        assert!(s.user.is_none());
        assert!(!s.busy);
    }

    #[test]
    fn failure_then_retry_then_ready() {
        let s = AuthSession::initializing().retrying(err(ErrorKind::Timeout));
        assert_eq!(s.phase, Phase::Retrying);
        assert_eq!(s.retry_count, 0);
        assert!(s.can_retry(1));

        let s = s.retry_attempt();
        assert_eq!(s.phase, Phase::Initializing);
        assert_eq!(s.retry_count, 1);
        assert!(s.last_error.is_none());

        let s = s.ready(Some(customer("u1", 0)));
        assert!(s.is_ready());
        assert_eq!(s.retry_count, 1);
        assert_eq!(s.user.as_ref().unwrap().id, "u1");
    }

    #[test]
    fn retry_affordance_disappears_at_budget() {
        let s = AuthSession::initializing()
            .retrying(err(ErrorKind::Transport))
            .retry_attempt()
            .retrying(err(ErrorKind::Transport));
        assert!(!s.can_retry(1));
        assert!(s.can_retry(2));
    }

    #[test]
    fn exhausted_keeps_last_error_and_drops_user() {
        let s = AuthSession::initializing()
            .ready(Some(customer("u1", 3)))
            .retrying(err(ErrorKind::Server))
            .exhausted(None);
        assert_eq!(s.phase, Phase::ExhaustedRetries);
        assert!(s.user.is_none());
        assert_eq!(s.last_error.unwrap().kind, ErrorKind::Server);
    }

    #[test]
    fn failed_action_does_not_touch_retry_count() {
        let s = AuthSession::initializing()
            .retrying(err(ErrorKind::Transport))
            .retry_attempt()
            .ready(None)
            .busy()
            .failed_action(err(ErrorKind::InvalidCredentials));
        assert_eq!(s.retry_count, 1);
        assert!(!s.busy);
        assert_eq!(s.last_error.unwrap().kind, ErrorKind::InvalidCredentials);
    }

    #[test]
    fn signed_out_is_clean_ready() {
        let s = AuthSession::initializing()
            .ready(Some(customer("u1", 1)))
            .with_password_recovery(true)
            .busy()
            .signed_out();
        assert_eq!(s.phase, Phase::Ready);
        assert!(s.user.is_none());
        assert!(!s.busy);
        assert!(!s.password_recovery);
        assert_eq!(s.retry_count, 0);
    }
}
