//! Session state machine — signed-in identity and its derived profile.
//!
//! DESIGN
//! ======
//! `SessionMachine` owns the only copy of the auth state and publishes it on a
//! `watch` channel. State changes come from two places: the imperative
//! operations (`sign_in`, `sign_up`, `sign_out`, `initialize`) running on the
//! caller's task, and a reconciliation task that consumes the backend's
//! notification stream. Both resolve the profile before publishing, so no
//! observer ever sees a session whose profile fetch has not been attempted.
//!
//! ORDERING
//! ========
//! Every resolution attempt takes a `Ticket`: the backend revision it reflects
//! plus a local sequence number drawn when the attempt starts. Results are
//! published only if their ticket is newer than the last published one, so a
//! slow profile fetch never overwrites a newer state. Operations take their
//! ticket after their last backend call; a notification queued before that
//! call carries a lower revision and loses.
//!
//! LIFECYCLE
//! =========
//! `initialize` subscribes once and spawns the reconciliation task.
//! `shutdown` (also run on drop) closes the machine, aborts the task (dropping
//! the subscription and every in-flight fetch) and makes late results no-ops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::backend::{AuthBackend, ProfileStore, Subscription, SubscriptionError};
use crate::config::MachineConfig;
use crate::error::{AuthError, AuthResult};
use crate::gate::{self, Access};
use crate::types::{Credentials, Profile, Role, Session, SessionState, SignUp};

// =============================================================================
// TICKETS
// =============================================================================

/// Position of a resolution attempt. Ordered by revision, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub(crate) struct Ticket {
    revision: u64,
    seq: u64,
}

// =============================================================================
// SHARED CORE
// =============================================================================

struct Core {
    backend: Arc<dyn AuthBackend>,
    profiles: Arc<dyn ProfileStore>,
    config: MachineConfig,
    state_tx: watch::Sender<SessionState>,
    next_seq: AtomicU64,
    /// Ticket of the last published state. Also guards the closed flag.
    published: Mutex<Ticket>,
    closed: AtomicBool,
}

impl Core {
    fn published(&self) -> MutexGuard<'_, Ticket> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> AuthResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AuthError::ShutDown);
        }
        Ok(())
    }

    fn ticket_at(&self, revision: u64) -> Ticket {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket { revision, seq }
    }

    /// Ticket reflecting everything the backend has emitted so far.
    fn ticket(&self) -> Ticket {
        self.ticket_at(self.backend.revision())
    }

    /// Publish `state` unless a newer result is already out or the machine is closed.
    fn commit(&self, ticket: Ticket, state: SessionState) -> bool {
        let mut published = self.published();
        if self.closed.load(Ordering::SeqCst) {
            debug!(seq = ticket.seq, "discarding session resolution after shutdown");
            return false;
        }
        if ticket <= *published {
            debug!(
                seq = ticket.seq,
                revision = ticket.revision,
                published_seq = published.seq,
                published_revision = published.revision,
                "discarding stale session resolution"
            );
            return false;
        }
        *published = ticket;
        self.state_tx.send_replace(state);
        true
    }

    /// Profile for `user_id`, or `None` when it cannot be loaded. Failures are
    /// logged and otherwise absorbed: the user stays signed in without a role.
    async fn fetch_profile(&self, user_id: &str) -> Option<Profile> {
        match self.profiles.select_by_id(user_id).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                let err = AuthError::ProfileFetch { user_id: user_id.to_owned(), message: e.to_string() };
                warn!(error = %err, "profile unavailable, treating user as unauthorized");
                None
            }
        }
    }

    async fn resolve(&self, session: Option<Session>) -> SessionState {
        match session {
            Some(session) => {
                let profile = self.fetch_profile(&session.user_id).await;
                SessionState::Authenticated { session, profile }
            }
            None => SessionState::Anonymous,
        }
    }
}

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Consume the notification stream until it closes or the task is aborted.
async fn reconcile(core: Arc<Core>, mut subscription: Subscription) {
    let mut pending: JoinSet<(Ticket, SessionState)> = JoinSet::new();

    loop {
        tokio::select! {
            received = subscription.next() => match received {
                Ok(notification) => {
                    let ticket = core.ticket_at(notification.revision);
                    debug!(
                        event = ?notification.event,
                        revision = notification.revision,
                        seq = ticket.seq,
                        "auth notification received"
                    );
                    let resolver = Arc::clone(&core);
                    pending.spawn(async move {
                        let state = resolver.resolve(notification.session).await;
                        (ticket, state)
                    });
                }
                Err(e) => {
                    let err = AuthError::Subscription(e.to_string());
                    warn!(error = %err, "dropping cached session until the user signs in again");
                    core.commit(core.ticket(), SessionState::Anonymous);
                    if e == SubscriptionError::Closed {
                        break;
                    }
                }
            },
            Some(joined) = pending.join_next(), if !pending.is_empty() => match joined {
                Ok((ticket, state)) => {
                    core.commit(ticket, state);
                }
                Err(e) => warn!(error = %e, "session resolution task failed"),
            },
        }
    }

    debug!("auth notification stream ended");
}

// =============================================================================
// MACHINE
// =============================================================================

/// Owner of the auth state. Share it by reference or `Arc`; dropping it tears
/// down the notification subscription.
pub struct SessionMachine {
    core: Arc<Core>,
    initialized: AtomicBool,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMachine {
    #[must_use]
    pub fn new(backend: Arc<dyn AuthBackend>, profiles: Arc<dyn ProfileStore>, config: MachineConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let core = Core {
            backend,
            profiles,
            config,
            state_tx,
            next_seq: AtomicU64::new(0),
            published: Mutex::new(Ticket::default()),
            closed: AtomicBool::new(false),
        };
        Self { core: Arc::new(core), initialized: AtomicBool::new(false), reconciler: Mutex::new(None) }
    }

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.core.config
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.core.state_tx.borrow().clone()
    }

    /// Receiver that wakes on every published state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.core.state_tx.subscribe()
    }

    #[must_use]
    pub fn user(&self) -> Option<Session> {
        self.core.state_tx.borrow().user().cloned()
    }

    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.core.state_tx.borrow().profile().cloned()
    }

    #[must_use]
    pub fn loading(&self) -> bool {
        self.core.state_tx.borrow().loading()
    }

    /// Gate decision for the current state.
    #[must_use]
    pub fn can_access(&self, allowed_roles: &[Role]) -> Access {
        gate::can_access(&self.core.state_tx.borrow(), allowed_roles)
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Subscribe to backend notifications and resolve any persisted session.
    ///
    /// A failing session lookup is logged and resolves to `Anonymous`; either
    /// way the loading flag clears once this returns.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AlreadyInitialized`] on a second call and
    /// [`AuthError::ShutDown`] after shutdown.
    pub async fn initialize(&self) -> AuthResult<()> {
        self.core.ensure_open()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(AuthError::AlreadyInitialized);
        }

        self.core.state_tx.send_replace(SessionState::Loading);

        let subscription = self.core.backend.subscribe();
        let handle = tokio::spawn(reconcile(Arc::clone(&self.core), subscription));
        *self.reconciler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let session = match self.core.backend.get_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "session lookup failed, starting signed out");
                None
            }
        };
        let ticket = self.core.ticket();
        let state = self.core.resolve(session).await;
        if self.core.commit(ticket, state) {
            info!(signed_in = self.user().is_some(), "initial session resolved");
        }
        Ok(())
    }

    /// Stop reacting to the backend. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        {
            let _published = self.core.published();
            if self.core.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        if let Some(handle) = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        debug!("session machine shut down");
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Sign in with email and password, then load the profile.
    ///
    /// # Errors
    ///
    /// [`AuthError::Credential`] with the backend's message when the
    /// credentials are refused; state is left unchanged.
    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<Session> {
        self.core.ensure_open()?;
        let credentials = Credentials::new(email, password);
        let session = self
            .core
            .backend
            .sign_in_with_password(&credentials)
            .await
            .map_err(AuthError::from_credential_failure)?;

        let ticket = self.core.ticket();
        let state = self.core.resolve(Some(session.clone())).await;
        self.core.commit(ticket, state);
        info!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    /// Create an account and its profile with the configured defaults.
    ///
    /// When the backend opens a session the machine becomes `Authenticated`.
    /// When it waits for email confirmation the profile is still created but
    /// the published state is left as it was, since the backend holds no
    /// session for the new account.
    ///
    /// # Errors
    ///
    /// [`AuthError::Credential`] when the backend refuses the account.
    /// [`AuthError::ProfileCreation`] when the account was created but the
    /// profile insert failed; a signed-in account is then published without
    /// a profile.
    pub async fn sign_up(&self, email: &str, password: &str, name: &str) -> AuthResult<SignUp> {
        self.core.ensure_open()?;
        let credentials = Credentials::new(email, password);
        let outcome = self
            .core
            .backend
            .sign_up(&credentials, name)
            .await
            .map_err(AuthError::from_credential_failure)?;

        let account = outcome.account();
        let profile = Profile {
            id: account.user_id.clone(),
            name: name.to_owned(),
            role: self.core.config.default_role,
            preferred_language: self.core.config.default_language,
        };
        if let Err(e) = self.core.profiles.insert(&profile).await {
            let err = AuthError::ProfileCreation { user_id: account.user_id.clone(), message: e.to_string() };
            error!(error = %err, "sign-up left an account without a profile");
            if let SignUp::SignedIn(session) = outcome {
                let ticket = self.core.ticket();
                self.core
                    .commit(ticket, SessionState::Authenticated { session, profile: None });
            }
            return Err(err);
        }

        let SignUp::SignedIn(session) = &outcome else {
            info!(user_id = %account.user_id, "signed up, awaiting email confirmation");
            return Ok(outcome);
        };
        // Ticket after the insert so that any notification resolved later sees the profile.
        let ticket = self.core.ticket();
        let state = self.core.resolve(Some(session.clone())).await;
        self.core.commit(ticket, state);
        info!(user_id = %session.user_id, role = %profile.role, "signed up");
        Ok(outcome)
    }

    /// Sign out at the backend, then clear the cached session and profile.
    ///
    /// # Errors
    ///
    /// [`AuthError::Backend`] if the backend does not confirm; the cached
    /// state is kept in that case.
    pub async fn sign_out(&self) -> AuthResult<()> {
        self.core.ensure_open()?;
        self.core
            .backend
            .sign_out()
            .await
            .map_err(AuthError::from_backend_failure)?;

        let ticket = self.core.ticket();
        self.core.commit(ticket, SessionState::Anonymous);
        info!("signed out");
        Ok(())
    }

    /// Request a password reset mail pointing at the configured redirect.
    ///
    /// # Errors
    ///
    /// [`AuthError::Backend`] with the backend's message.
    pub async fn reset_password(&self, email: &str) -> AuthResult<()> {
        self.core.ensure_open()?;
        self.core
            .backend
            .reset_password_for_email(email, &self.core.config.reset_redirect)
            .await
            .map_err(AuthError::from_backend_failure)?;
        info!(redirect_to = %self.core.config.reset_redirect, "password reset requested");
        Ok(())
    }

    /// Change the signed-in user's password.
    ///
    /// # Errors
    ///
    /// [`AuthError::Backend`] with the backend's message.
    pub async fn update_password(&self, new_password: &str) -> AuthResult<()> {
        self.core.ensure_open()?;
        self.core
            .backend
            .update_password(new_password)
            .await
            .map_err(AuthError::from_backend_failure)?;
        info!("password updated");
        Ok(())
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "machine_test.rs"]
mod tests;
