//! Scripted in-memory backend and helpers shared by unit tests.

use crate::auth::PreferenceStore;
use crate::backend::{
    AuthBackend, AuthChange, NewProfile, PointsUpdate, Role, Session, SignUpAttrs, User,
    VisitStore, VisitStoreError,
};
use crate::error::{ClassifiedError, ErrorKind};
use crate::qr::Clock;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

pub fn customer(id: &str, points: u32) -> User {
    User {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        full_name: format!("Customer {id}"),
        role: Role::Customer,
        current_points: points,
        total_visits: 0,
        created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    }
}

pub fn session_for(user_id: &str) -> Session {
    Session {
        access_token: format!("access-{user_id}"),
        refresh_token: format!("refresh-{user_id}"),
        expires_at: i64::MAX,
        user_id: user_id.to_string(),
        email: Some(format!("{user_id}@example.com")),
    }
}

fn fail(kind: ErrorKind, context: &str) -> ClassifiedError {
    ClassifiedError::new(kind, context, "scripted failure")
}

/// Clock frozen at one instant.
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

// ── Preference ───────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryPreferenceStore {
    value: AtomicBool,
}

impl MemoryPreferenceStore {
    pub fn new(remembered: bool) -> Self {
        Self {
            value: AtomicBool::new(remembered),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn remembered(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }

    fn set_remembered(&self, remember: bool) -> anyhow::Result<()> {
        self.value.store(remember, Ordering::SeqCst);
        Ok(())
    }
}

// ── Backend ──────────────────────────────────────────────────────

/// What `get_session` does.
#[derive(Clone)]
pub enum SessionScript {
    Present(Session),
    Absent,
    Fail(ErrorKind),
    /// Never resolves.
    Hang,
}

#[derive(Default)]
pub struct Calls {
    pub get_session: AtomicUsize,
    pub get_profile: AtomicUsize,
    pub sign_in: AtomicUsize,
    pub sign_up: AtomicUsize,
    pub insert_profile: AtomicUsize,
    pub sign_out: AtomicUsize,
    pub update_password: AtomicUsize,
    pub reset_password: AtomicUsize,
}

impl Calls {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    pub calls: Calls,
    session: Mutex<SessionScript>,
    session_delay: Mutex<Duration>,
    users: Mutex<HashMap<String, User>>,
    /// `get_profile` answers NotFound this many more times.
    profile_misses: AtomicU32,
    profile_hang: AtomicBool,
    action_error: Mutex<Option<ErrorKind>>,
    visits: Mutex<Vec<(String, String, String)>>,
    visit_lookup_error: Mutex<Option<ErrorKind>>,
    next_id: AtomicU32,
    changes: broadcast::Sender<AuthChange>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            calls: Calls::default(),
            session: Mutex::new(SessionScript::Absent),
            session_delay: Mutex::new(Duration::ZERO),
            users: Mutex::new(HashMap::new()),
            profile_misses: AtomicU32::new(0),
            profile_hang: AtomicBool::new(false),
            action_error: Mutex::new(None),
            visits: Mutex::new(Vec::new()),
            visit_lookup_error: Mutex::new(None),
            next_id: AtomicU32::new(1),
            changes,
        }
    }

    pub fn insert_user(&self, user: User) {
        self.users.lock().insert(user.id.clone(), user);
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.users.lock().get(id).cloned()
    }

    pub fn script_session(&self, script: SessionScript) {
        *self.session.lock() = script;
    }

    /// Signed-in user with a persisted session and a profile row.
    pub fn with_signed_in(&self, user: User) {
        self.script_session(SessionScript::Present(session_for(&user.id)));
        self.insert_user(user);
    }

    pub fn delay_session(&self, delay: Duration) {
        *self.session_delay.lock() = delay;
    }

    pub fn miss_profile(&self, times: u32) {
        self.profile_misses.store(times, Ordering::SeqCst);
    }

    pub fn hang_profile(&self) {
        self.profile_hang.store(true, Ordering::SeqCst);
    }

    /// Make sign-in, sign-up and password calls fail with `kind`.
    pub fn fail_actions(&self, kind: ErrorKind) {
        *self.action_error.lock() = Some(kind);
    }

    pub fn fail_visit_lookups(&self, kind: ErrorKind) {
        *self.visit_lookup_error.lock() = Some(kind);
    }

    pub fn visit_count(&self) -> usize {
        self.visits.lock().len()
    }

    pub fn emit(&self, change: AuthChange) {
        let _ = self.changes.send(change);
    }

    fn scripted_action_error(&self, context: &str) -> Result<(), ClassifiedError> {
        match *self.action_error.lock() {
            Some(kind) => Err(fail(kind, context)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AuthBackend for FakeBackend {
    async fn get_session(&self) -> Result<Option<Session>, ClassifiedError> {
        self.calls.get_session.fetch_add(1, Ordering::SeqCst);
        let delay = *self.session_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let script = self.session.lock().clone();
        match script {
            SessionScript::Present(session) => Ok(Some(session)),
            SessionScript::Absent => Ok(None),
            SessionScript::Fail(kind) => Err(fail(kind, "getting session")),
            SessionScript::Hang => std::future::pending().await,
        }
    }

    async fn get_profile(&self, subject_id: &str) -> Result<User, ClassifiedError> {
        self.calls.get_profile.fetch_add(1, Ordering::SeqCst);
        if self.profile_hang.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let missed = self
            .profile_misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if missed {
            return Err(fail(ErrorKind::NotFound, "fetching user profile"));
        }
        self.user(subject_id)
            .ok_or_else(|| fail(ErrorKind::NotFound, "fetching user profile"))
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        _password: &str,
    ) -> Result<Session, ClassifiedError> {
        self.calls.sign_in.fetch_add(1, Ordering::SeqCst);
        self.scripted_action_error("signing in")?;
        let user = self
            .users
            .lock()
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(|| fail(ErrorKind::InvalidCredentials, "signing in"))?;
        let session = session_for(&user.id);
        self.emit(AuthChange::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _attrs: &SignUpAttrs,
    ) -> Result<String, ClassifiedError> {
        self.calls.sign_up.fetch_add(1, Ordering::SeqCst);
        self.scripted_action_error("signing up")?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("new-user-{n}"))
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<(), ClassifiedError> {
        self.calls.insert_profile.fetch_add(1, Ordering::SeqCst);
        self.insert_user(User {
            id: profile.id.clone(),
            email: profile.email.clone(),
            full_name: profile.full_name.clone(),
            role: profile.role,
            current_points: profile.current_points,
            total_visits: profile.total_visits,
            created_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ClassifiedError> {
        self.calls.sign_out.fetch_add(1, Ordering::SeqCst);
        self.script_session(SessionScript::Absent);
        self.emit(AuthChange::SignedOut);
        Ok(())
    }

    async fn update_password(&self, _new_password: &str) -> Result<(), ClassifiedError> {
        self.calls.update_password.fetch_add(1, Ordering::SeqCst);
        self.scripted_action_error("updating password")
    }

    async fn reset_password_for_email(&self, _email: &str) -> Result<(), ClassifiedError> {
        self.calls.reset_password.fetch_add(1, Ordering::SeqCst);
        self.scripted_action_error("sending password reset")
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl VisitStore for FakeBackend {
    async fn is_signature_used(&self, signature: &str) -> Result<bool, ClassifiedError> {
        if let Some(kind) = *self.visit_lookup_error.lock() {
            return Err(fail(kind, "checking QR signature"));
        }
        Ok(self.visits.lock().iter().any(|(_, _, sig)| sig == signature))
    }

    async fn get_customer(&self, subject_id: &str) -> Result<User, ClassifiedError> {
        self.user(subject_id)
            .ok_or_else(|| fail(ErrorKind::NotFound, "loading customer"))
    }

    async fn record_visit(
        &self,
        subject_id: &str,
        staff_id: &str,
        signature: &str,
    ) -> Result<(), VisitStoreError> {
        let mut visits = self.visits.lock();
        if visits.iter().any(|(_, _, sig)| sig == signature) {
            return Err(VisitStoreError::DuplicateSignature);
        }
        visits.push((
            subject_id.to_string(),
            staff_id.to_string(),
            signature.to_string(),
        ));
        Ok(())
    }

    async fn increment_points(&self, subject_id: &str) -> Result<PointsUpdate, ClassifiedError> {
        let mut users = self.users.lock();
        let user = users
            .get_mut(subject_id)
            .ok_or_else(|| fail(ErrorKind::NotFound, "adding points"))?;
        user.current_points += 1;
        user.total_visits += 1;
        Ok(PointsUpdate {
            current_points: user.current_points,
            total_visits: user.total_visits,
        })
    }
}
