//! Authentication state machine.
//!
//! Resolves "who is signed in" at start-up, bounds every remote call, and
//! offers a small explicit retry budget before forcing a clean slate.
//!
//! ## Design
//! - State is an immutable [`AuthSession`] snapshot republished through a
//!   `watch` channel on every transition.
//! - A bootstrap already in flight is shared: concurrent callers await the
//!   same attempt instead of issuing duplicate session lookups.
//! - Every operation runs under a child of the machine's root
//!   `CancellationToken`. `reset`, `sign_out` and `teardown` rotate or cancel
//!   it, and completions arriving under a cancelled token are dropped.
//! - `retry()` is serialized so two callers cannot both spend the budget.
//! - The remembered preference is authoritative: when it is unset, any
//!   persisted session is discarded instead of restored.

use super::preference::PreferenceStore;
use super::session::{AuthSession, Phase};
use crate::backend::{AuthBackend, AuthChange, NewProfile, SignUpAttrs, User};
use crate::config::AuthConfig;
use crate::error::{ClassifiedError, ErrorKind};
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type BootstrapResult = Result<Option<User>, ClassifiedError>;
type BootstrapFuture = BoxFuture<'static, BootstrapResult>;

/// Result of an explicit [`AuthMachine::retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The bootstrap succeeded; `None` means nobody is signed in.
    Recovered(Option<User>),
    /// The attempt failed but budget remains.
    Failed(ClassifiedError),
    /// Budget spent. Credentials are cleared; restart from scratch.
    Exhausted,
}

pub struct AuthMachine {
    backend: Arc<dyn AuthBackend>,
    preference: Arc<dyn PreferenceStore>,
    config: AuthConfig,
    state: watch::Sender<AuthSession>,
    /// Bootstrap currently running, tagged with its generation. Held weakly:
    /// the attempt lives only as long as some caller awaits it.
    inflight: Mutex<Option<(u64, WeakShared<BootstrapFuture>)>>,
    generation: AtomicU64,
    retry_gate: tokio::sync::Mutex<()>,
    /// Cancelled on teardown. Parent of every operation scope.
    alive: CancellationToken,
    scope: Mutex<CancellationToken>,
}

impl AuthMachine {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        preference: Arc<dyn PreferenceStore>,
        config: AuthConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(AuthSession::initializing());
        let alive = CancellationToken::new();
        let scope = alive.child_token();
        Arc::new(Self {
            backend,
            preference,
            config,
            state,
            inflight: Mutex::new(None),
            generation: AtomicU64::new(0),
            retry_gate: tokio::sync::Mutex::new(()),
            alive,
            scope: Mutex::new(scope),
        })
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn snapshot(&self) -> AuthSession {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSession> {
        self.state.subscribe()
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    // ── Bootstrap ────────────────────────────────────────────────

    /// Resolve the current user from the persisted session.
    ///
    /// Calls made while an attempt is already running join that attempt.
    pub async fn bootstrap(self: &Arc<Self>) -> BootstrapResult {
        let pending = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref().and_then(|(_, weak)| weak.upgrade()) {
                Some(pending) => {
                    tracing::debug!("Joining in-flight auth bootstrap");
                    pending
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let this = Arc::clone(self);
                    let pending: Shared<BootstrapFuture> = async move {
                        let result = this.run_bootstrap().await;
                        this.settle(generation);
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = pending.downgrade().map(|weak| (generation, weak));
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_bootstrap(&self) -> BootstrapResult {
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::loading);

        if !self.preference.remembered() {
            tracing::info!("Remember-me not set, discarding any persisted session");
            if let Err(e) = self.backend.sign_out().await {
                tracing::warn!(error = %e, "Discarding persisted session failed");
            }
            self.apply(&scope, |s| s.ready(None));
            return Ok(None);
        }

        match self.restore().await {
            Ok(user) => {
                let published = user.clone();
                if !self.apply(&scope, |s| s.ready(published)) {
                    // Abandoned by reset or teardown; nobody is signed in.
                    return Ok(None);
                }
                tracing::info!(
                    user_id = user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
                    "Auth bootstrap complete"
                );
                Ok(user)
            }
            Err(error) => {
                tracing::warn!(kind = %error.kind, error = %error, "Auth bootstrap failed");
                let published = error.clone();
                self.apply(&scope, |s| s.retrying(published));
                Err(error)
            }
        }
    }

    async fn restore(&self) -> BootstrapResult {
        let budget = self.config.session_timeout();
        let session = match tokio::time::timeout(budget, self.backend.get_session()).await {
            Ok(result) => result?,
            Err(_) => return Err(ClassifiedError::timeout("getting session", budget)),
        };

        let Some(session) = session else {
            tracing::info!("No valid session found, clearing remember-me");
            self.forget_preference();
            return Ok(None);
        };

        self.load_profile(&session.user_id).await.map(Some)
    }

    /// Fetch the profile row, retrying a "not found" once after a short
    /// delay. A freshly inserted row can lag the sign-up call.
    async fn load_profile(&self, subject_id: &str) -> Result<User, ClassifiedError> {
        match self.fetch_profile(subject_id).await {
            Err(e) if e.kind == ErrorKind::NotFound => {
                tracing::debug!(subject_id, "Profile not found yet, retrying once");
                tokio::time::sleep(self.config.profile_retry_delay()).await;
                self.fetch_profile(subject_id).await
            }
            other => other,
        }
    }

    async fn fetch_profile(&self, subject_id: &str) -> Result<User, ClassifiedError> {
        let budget = self.config.profile_timeout();
        match tokio::time::timeout(budget, self.backend.get_profile(subject_id)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifiedError::timeout("fetching user profile", budget)),
        }
    }

    fn settle(&self, generation: u64) {
        let mut inflight = self.inflight.lock();
        if matches!(inflight.as_ref(), Some((g, _)) if *g == generation) {
            *inflight = None;
        }
    }

    fn forget_inflight(&self) {
        self.inflight.lock().take();
    }

    // ── Retry and reset ──────────────────────────────────────────

    /// Spend one retry on another bootstrap attempt.
    ///
    /// Budget is only spent after a failed bootstrap (`Retrying`). In `Ready`
    /// the current user is returned as is; in `Initializing` the caller waits
    /// for the running (or a fresh) bootstrap instead.
    ///
    /// Once the budget is gone the machine clears credentials, moves to
    /// [`Phase::ExhaustedRetries`] and returns [`RetryOutcome::Exhausted`]
    /// without contacting the session service again.
    pub async fn retry(self: &Arc<Self>) -> RetryOutcome {
        let _gate = self.retry_gate.lock().await;

        let current = self.snapshot();
        match current.phase {
            Phase::ExhaustedRetries => return RetryOutcome::Exhausted,
            Phase::Ready => return RetryOutcome::Recovered(current.user),
            Phase::Initializing => {
                tracing::debug!("Nothing failed yet, awaiting bootstrap instead of retrying");
                return match self.bootstrap().await {
                    Ok(user) => RetryOutcome::Recovered(user),
                    Err(error) => RetryOutcome::Failed(error),
                };
            }
            Phase::Retrying => {}
        }

        let attempt = current.retry_count + 1;
        if attempt > self.config.max_retries {
            tracing::warn!(
                max_retries = self.config.max_retries,
                "Retry budget spent, clearing credentials"
            );
            self.exhaust(None).await;
            return RetryOutcome::Exhausted;
        }

        tracing::info!(
            attempt,
            max_retries = self.config.max_retries,
            "Retrying auth bootstrap"
        );
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::retry_attempt);

        match self.bootstrap().await {
            Ok(user) => RetryOutcome::Recovered(user),
            Err(error) if attempt >= self.config.max_retries => {
                tracing::warn!(attempt, "Final retry failed, clearing credentials");
                self.exhaust(Some(error)).await;
                RetryOutcome::Exhausted
            }
            Err(error) => RetryOutcome::Failed(error),
        }
    }

    async fn exhaust(&self, error: Option<ClassifiedError>) {
        self.clear_credentials().await;
        let scope = self.current_scope();
        self.apply(&scope, |s| s.exhausted(error));
    }

    /// Clear credentials and return to a fresh `Initializing` state.
    ///
    /// Anything still running is abandoned; its results are discarded.
    pub async fn reset(&self) {
        tracing::info!("Resetting authentication state");
        self.clear_credentials().await;
        let scope = self.current_scope();
        self.apply(&scope, |_| AuthSession::initializing());
    }

    async fn clear_credentials(&self) {
        self.rotate_scope();
        self.forget_inflight();
        self.forget_preference();
        if let Err(e) = self.backend.sign_out().await {
            tracing::warn!(error = %e, "Sign-out while clearing credentials failed");
        }
    }

    // ── User actions ─────────────────────────────────────────────

    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        remember: bool,
    ) -> Result<User, ClassifiedError> {
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::busy);

        let result = async {
            let session = self
                .backend
                .sign_in_with_password(email.trim(), password)
                .await?;
            self.persist_preference(remember);
            self.load_profile(&session.user_id).await
        }
        .await;

        self.finish_with_user(&scope, "Sign-in", result)
    }

    /// Create the account and its profile row, then sign the user in.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        attrs: &SignUpAttrs,
        remember: bool,
    ) -> Result<User, ClassifiedError> {
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::busy);

        let result = async {
            let email = email.trim();
            let subject_id = self.backend.sign_up(email, password, attrs).await?;
            self.backend
                .insert_profile(&NewProfile::new(&subject_id, email, attrs))
                .await?;
            self.persist_preference(remember);
            self.load_profile(&subject_id).await
        }
        .await;

        self.finish_with_user(&scope, "Sign-up", result)
    }

    /// Sign out everywhere this client knows about.
    ///
    /// Local state is cleared even when the remote call fails.
    pub async fn sign_out(&self) -> Result<(), ClassifiedError> {
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::busy);

        self.rotate_scope();
        self.forget_inflight();
        self.forget_preference();
        let result = self.backend.sign_out().await;

        let scope = self.current_scope();
        match result {
            Ok(()) => {
                tracing::info!("Signed out");
                self.apply(&scope, AuthSession::signed_out);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Remote sign-out failed, local session cleared");
                self.apply(&scope, |s| s.signed_out().failed_action(e.clone()));
                Err(e)
            }
        }
    }

    pub async fn update_password(&self, new_password: &str) -> Result<(), ClassifiedError> {
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::busy);

        match self.backend.update_password(new_password).await {
            Ok(()) => {
                tracing::info!("Password updated");
                self.apply(&scope, |s| s.idle().with_password_recovery(false));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(kind = %e.kind, "Password update failed");
                self.apply(&scope, |s| s.failed_action(e.clone()));
                Err(e)
            }
        }
    }

    /// Ask the auth service to email a password-reset link.
    pub async fn reset_password(&self, email: &str) -> Result<(), ClassifiedError> {
        let scope = self.current_scope();
        self.apply(&scope, AuthSession::busy);

        match self.backend.reset_password_for_email(email.trim()).await {
            Ok(()) => {
                tracing::info!("Password reset email requested");
                self.apply(&scope, AuthSession::idle);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(kind = %e.kind, "Password reset request failed");
                self.apply(&scope, |s| s.failed_action(e.clone()));
                Err(e)
            }
        }
    }

    fn finish_with_user(
        &self,
        scope: &CancellationToken,
        action: &str,
        result: Result<User, ClassifiedError>,
    ) -> Result<User, ClassifiedError> {
        match &result {
            Ok(user) => {
                tracing::info!(user_id = %user.id, "{action} succeeded");
                let user = user.clone();
                self.apply(scope, |s| s.ready(Some(user)));
            }
            Err(e) => {
                tracing::warn!(kind = %e.kind, error = %e, "{action} failed");
                let e = e.clone();
                self.apply(scope, |s| s.failed_action(e));
            }
        }
        result
    }

    // ── Change notifications ─────────────────────────────────────

    /// Apply session changes pushed by the auth service until teardown.
    ///
    /// Changes are ignored until the bootstrap has reached `Ready`.
    pub fn listen_auth_changes(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.backend.subscribe_auth_changes();
        let alive = self.alive.clone();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    () = alive.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(change) => change,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Auth change listener lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let Some(machine) = weak.upgrade() else {
                    break;
                };
                machine.handle_auth_change(change).await;
            }
            tracing::debug!("Auth change listener stopped");
        })
    }

    async fn handle_auth_change(&self, change: AuthChange) {
        let scope = self.current_scope();
        let current = self.snapshot();
        if current.phase != Phase::Ready {
            tracing::debug!(phase = %current.phase, "Ignoring auth change before ready");
            return;
        }

        match change {
            AuthChange::SignedOut => {
                tracing::debug!("Auth change: signed out");
                self.apply(&scope, |s| s.with_user(None));
            }
            AuthChange::SignedIn(session) => {
                if current
                    .user
                    .as_ref()
                    .is_some_and(|u| u.id == session.user_id)
                {
                    return;
                }
                match self.load_profile(&session.user_id).await {
                    Ok(user) => {
                        self.apply(&scope, |s| s.with_user(Some(user)));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Profile load after sign-in change failed");
                        self.apply(&scope, |s| s.with_user(None));
                    }
                }
            }
            AuthChange::UserUpdated => {
                let Some(user) = current.user else { return };
                match self.load_profile(&user.id).await {
                    Ok(user) => {
                        self.apply(&scope, |s| s.with_user(Some(user)));
                    }
                    Err(e) => tracing::warn!(error = %e, "Profile refresh failed"),
                }
            }
            AuthChange::PasswordRecovery => {
                tracing::info!("Password recovery sign-in");
                self.apply(&scope, |s| s.with_password_recovery(true));
            }
            AuthChange::TokenRefreshed => tracing::debug!("Auth change: token refreshed"),
        }
    }

    /// Stop the change listener and discard every pending completion.
    pub fn teardown(&self) {
        self.alive.cancel();
        self.forget_inflight();
        tracing::debug!("Auth machine torn down");
    }

    // ── Internals ────────────────────────────────────────────────

    fn current_scope(&self) -> CancellationToken {
        self.scope.lock().clone()
    }

    fn rotate_scope(&self) {
        let mut scope = self.scope.lock();
        scope.cancel();
        *scope = self.alive.child_token();
    }

    /// Publish the next snapshot unless the operation was abandoned.
    fn apply(
        &self,
        scope: &CancellationToken,
        transition: impl FnOnce(AuthSession) -> AuthSession,
    ) -> bool {
        if scope.is_cancelled() {
            tracing::debug!("Discarding result of an abandoned auth operation");
            return false;
        }
        self.state.send_modify(|session| {
            let current = std::mem::take(session);
            *session = transition(current);
        });
        true
    }

    fn persist_preference(&self, remember: bool) {
        if let Err(e) = self.preference.set_remembered(remember) {
            tracing::warn!(error = %e, "Failed to store remember-me flag");
        }
    }

    fn forget_preference(&self) {
        self.persist_preference(false);
    }
}

impl Drop for AuthMachine {
    fn drop(&mut self) {
        self.alive.cancel();
    }
}
