//! In-memory auth backend and profile store.
//!
//! DESIGN
//! ======
//! One `MemoryBackend` plays both collaborators so sign-up can create an
//! account and its profile in the same place. It emits the same notifications
//! a hosted backend would (`SIGNED_IN` after sign-in, `SIGNED_OUT` after
//! sign-out) and exposes failure injection plus fetch gates so callers can
//! reproduce partial failures and out-of-order responses deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use super::{AuthBackend, AuthNotifier, BackendError, ProfileStore, StoreError, Subscription};
use crate::types::{AuthEvent, AuthNotification, Credentials, Profile, Session, SignUp};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone)]
struct Account {
    user_id: String,
    password: String,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct Failures {
    get_session: Option<BackendError>,
    sign_out: Option<BackendError>,
    reset_password: Option<BackendError>,
    update_password: Option<BackendError>,
    profile_insert: Option<StoreError>,
    profile_fetch: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    current: Option<Session>,
    profiles: HashMap<String, Profile>,
    fetch_gates: HashMap<String, watch::Receiver<bool>>,
    reset_requests: Vec<(String, String)>,
    require_confirmation: bool,
    failures: Failures,
}

/// Holds back profile fetches for one user until released (or dropped).
#[derive(Debug)]
pub struct FetchGate {
    tx: watch::Sender<bool>,
}

impl FetchGate {
    pub fn release(self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    notifier: AuthNotifier,
    profile_fetches: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // SEEDING
    // =========================================================================

    /// Register an account directly, bypassing sign-up. Returns the account.
    pub fn add_account(&self, user_id: &str, email: &str, password: &str) -> Session {
        let mut inner = self.lock();
        inner.accounts.insert(
            email.to_owned(),
            Account { user_id: user_id.to_owned(), password: password.to_owned(), confirmed: true },
        );
        Session { user_id: user_id.to_owned(), email: email.to_owned() }
    }

    /// Make sign-up leave new accounts unconfirmed and signed out.
    pub fn require_email_confirmation(&self) {
        self.lock().require_confirmation = true;
    }

    /// Confirm the account for `email`. Returns false if there is none.
    pub fn confirm_email(&self, email: &str) -> bool {
        match self.lock().accounts.get_mut(email) {
            Some(account) => {
                account.confirmed = true;
                true
            }
            None => false,
        }
    }

    pub fn put_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id.clone(), profile);
    }

    #[must_use]
    pub fn profile(&self, user_id: &str) -> Option<Profile> {
        self.lock().profiles.get(user_id).cloned()
    }

    #[must_use]
    pub fn has_account(&self, email: &str) -> bool {
        self.lock().accounts.contains_key(email)
    }

    /// Pretend a session was persisted by an earlier run.
    pub fn restore_session(&self, session: Session) {
        self.lock().current = Some(session);
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.lock().current.clone()
    }

    // =========================================================================
    // OUT-OF-BAND EVENTS
    // =========================================================================

    /// Emit a raw notification, as the backend would for a change made elsewhere.
    pub fn emit(&self, notification: AuthNotification) -> usize {
        self.notifier.emit(notification)
    }

    /// Drop the current session and report it, as on token expiry.
    pub fn expire_session(&self) -> usize {
        self.lock().current = None;
        self.notifier.emit(AuthNotification::new(AuthEvent::SignedOut, None))
    }

    /// Report a token refresh for the current session, if any.
    pub fn refresh_session(&self) -> usize {
        let current = self.lock().current.clone();
        match current {
            Some(session) => self.notifier.emit(AuthNotification::new(AuthEvent::TokenRefreshed, Some(session))),
            None => 0,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.notifier.subscriber_count()
    }

    // =========================================================================
    // FAILURE INJECTION
    // =========================================================================

    pub fn fail_get_session(&self, err: BackendError) {
        self.lock().failures.get_session = Some(err);
    }

    pub fn fail_sign_out(&self, err: BackendError) {
        self.lock().failures.sign_out = Some(err);
    }

    pub fn fail_reset_password(&self, err: BackendError) {
        self.lock().failures.reset_password = Some(err);
    }

    pub fn fail_update_password(&self, err: BackendError) {
        self.lock().failures.update_password = Some(err);
    }

    pub fn fail_profile_insert(&self, err: StoreError) {
        self.lock().failures.profile_insert = Some(err);
    }

    pub fn fail_profile_fetch(&self, user_id: &str) {
        self.lock().failures.profile_fetch.insert(user_id.to_owned());
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        self.lock().failures = Failures::default();
    }

    /// Block profile fetches for `user_id` until the returned gate is released.
    #[must_use]
    pub fn hold_profile_fetch(&self, user_id: &str) -> FetchGate {
        let (tx, rx) = watch::channel(false);
        self.lock().fetch_gates.insert(user_id.to_owned(), rx);
        FetchGate { tx }
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    #[must_use]
    pub fn profile_fetches(&self) -> usize {
        self.profile_fetches.load(Ordering::SeqCst)
    }

    /// `(email, redirect_to)` pairs of every accepted reset request.
    #[must_use]
    pub fn reset_requests(&self) -> Vec<(String, String)> {
        self.lock().reset_requests.clone()
    }

    #[must_use]
    pub fn password_of(&self, email: &str) -> Option<String> {
        self.lock().accounts.get(email).map(|a| a.password.clone())
    }
}

#[async_trait::async_trait]
impl AuthBackend for MemoryBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let inner = self.lock();
        if let Some(err) = inner.failures.get_session.clone() {
            return Err(err);
        }
        Ok(inner.current.clone())
    }

    async fn sign_in_with_password(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        let session = {
            let mut inner = self.lock();
            let account = inner
                .accounts
                .get(&credentials.email)
                .filter(|a| a.password == credentials.password)
                .cloned()
                .ok_or_else(|| BackendError::Rejected("Invalid login credentials".into()))?;
            if !account.confirmed {
                return Err(BackendError::Rejected("Email not confirmed".into()));
            }
            let session = Session { user_id: account.user_id, email: credentials.email.clone() };
            inner.current = Some(session.clone());
            session
        };
        self.notifier.emit(AuthNotification::new(AuthEvent::SignedIn, Some(session.clone())));
        Ok(session)
    }

    async fn sign_up(&self, credentials: &Credentials, _name: &str) -> Result<SignUp, BackendError> {
        if !credentials.email.contains('@') {
            return Err(BackendError::Rejected("Unable to validate email address: invalid format".into()));
        }
        if credentials.password.len() < MIN_PASSWORD_LEN {
            return Err(BackendError::Rejected(format!(
                "Password should be at least {MIN_PASSWORD_LEN} characters."
            )));
        }

        let session = {
            let mut inner = self.lock();
            if inner.accounts.contains_key(&credentials.email) {
                return Err(BackendError::Rejected("User already registered".into()));
            }
            let user_id = Uuid::new_v4().to_string();
            let confirmed = !inner.require_confirmation;
            inner.accounts.insert(
                credentials.email.clone(),
                Account { user_id: user_id.clone(), password: credentials.password.clone(), confirmed },
            );
            let session = Session { user_id, email: credentials.email.clone() };
            if !confirmed {
                return Ok(SignUp::ConfirmationPending(session));
            }
            inner.current = Some(session.clone());
            session
        };
        self.notifier.emit(AuthNotification::new(AuthEvent::SignedIn, Some(session.clone())));
        Ok(SignUp::SignedIn(session))
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        {
            let mut inner = self.lock();
            if let Some(err) = inner.failures.sign_out.clone() {
                return Err(err);
            }
            inner.current = None;
        }
        self.notifier.emit(AuthNotification::new(AuthEvent::SignedOut, None));
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str, redirect_to: &str) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if let Some(err) = inner.failures.reset_password.clone() {
            return Err(err);
        }
        inner.reset_requests.push((email.to_owned(), redirect_to.to_owned()));
        Ok(())
    }

    async fn update_password(&self, new_password: &str) -> Result<(), BackendError> {
        let session = {
            let mut inner = self.lock();
            if let Some(err) = inner.failures.update_password.clone() {
                return Err(err);
            }
            let Some(session) = inner.current.clone() else {
                return Err(BackendError::Rejected("Auth session missing!".into()));
            };
            if new_password.len() < MIN_PASSWORD_LEN {
                return Err(BackendError::Rejected(format!(
                    "Password should be at least {MIN_PASSWORD_LEN} characters."
                )));
            }
            if let Some(account) = inner.accounts.get_mut(&session.email) {
                account.password = new_password.to_owned();
            }
            session
        };
        self.notifier.emit(AuthNotification::new(AuthEvent::UserUpdated, Some(session)));
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    fn revision(&self) -> u64 {
        self.notifier.revision()
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryBackend {
    async fn select_by_id(&self, user_id: &str) -> Result<Profile, StoreError> {
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);

        let gate = self.lock().fetch_gates.get(user_id).cloned();
        if let Some(mut gate) = gate {
            // A dropped gate counts as released.
            let _ = gate.wait_for(|open| *open).await;
        }

        let inner = self.lock();
        if inner.failures.profile_fetch.contains(user_id) {
            return Err(StoreError::Backend(BackendError::Transport("profile store unavailable".into())));
        }
        inner.profiles.get(user_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert(&self, profile: &Profile) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(err) = inner.failures.profile_insert.clone() {
            return Err(err);
        }
        if inner.profiles.contains_key(&profile.id) {
            return Err(StoreError::Conflict(profile.id.clone()));
        }
        inner.profiles.insert(profile.id.clone(), profile.clone());
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
