//! External collaborators — the auth backend and the profile store.
//!
//! ARCHITECTURE
//! ============
//! The session machine only talks to these traits. `supabase` implements them
//! over HTTP; `memory` is a deterministic in-process fake used by tests and
//! offline runs. Both share `AuthNotifier` for the change-notification stream.

pub mod memory;
pub mod supabase;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::types::{AuthNotification, Credentials, Profile, Session, SignUp};

/// Buffered notifications per subscriber before it is reported as lagging.
pub const NOTIFICATION_CAPACITY: usize = 16;

// =============================================================================
// ERRORS
// =============================================================================

/// Failure reported by the auth backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend refused the request; the message is the backend's own.
    #[error("{0}")]
    Rejected(String),
    /// The request never produced a usable response.
    #[error("auth backend unreachable: {0}")]
    Transport(String),
    /// The response could not be decoded.
    #[error("unexpected auth backend response: {0}")]
    Decode(String),
}

/// Failure reported by the profile store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("profile not found")]
    NotFound,
    #[error("profile already exists: {0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failure of the notification stream itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscriber lagged and missed {0} notifications")]
    Lagged(u64),
    #[error("notification stream closed")]
    Closed,
}

// =============================================================================
// TRAITS
// =============================================================================

/// Managed auth provider: credentials, sessions, passwords, notifications.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    /// Session persisted at the backend, if any.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    async fn sign_in_with_password(&self, credentials: &Credentials) -> Result<Session, BackendError>;

    /// Create an account. `name` is forwarded as user metadata where supported.
    /// Backends that require email confirmation report `ConfirmationPending`
    /// and keep no session.
    async fn sign_up(&self, credentials: &Credentials, name: &str) -> Result<SignUp, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Send a password reset mail whose link lands on `redirect_to`.
    async fn reset_password_for_email(&self, email: &str, redirect_to: &str) -> Result<(), BackendError>;

    /// Change the password of the currently signed-in account.
    async fn update_password(&self, new_password: &str) -> Result<(), BackendError>;

    /// Start receiving auth change notifications.
    fn subscribe(&self) -> Subscription;

    /// Revision of the most recently emitted notification. Backends that do
    /// not stamp notifications report 0 and are ordered by arrival alone.
    fn revision(&self) -> u64 {
        0
    }
}

/// Keyed store of authorization profiles.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn select_by_id(&self, user_id: &str) -> Result<Profile, StoreError>;

    async fn insert(&self, profile: &Profile) -> Result<(), StoreError>;
}

// =============================================================================
// NOTIFICATION STREAM
// =============================================================================

/// Receiving end of the backend's notification stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<AuthNotification>,
}

impl Subscription {
    #[must_use]
    pub fn new(rx: broadcast::Receiver<AuthNotification>) -> Self {
        Self { rx }
    }

    /// Next notification, in the order the backend emitted them.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Lagged`] if notifications were dropped for
    /// this subscriber and [`SubscriptionError::Closed`] once the backend is gone.
    pub async fn next(&mut self) -> Result<AuthNotification, SubscriptionError> {
        match self.rx.recv().await {
            Ok(notification) => Ok(notification),
            Err(RecvError::Lagged(missed)) => Err(SubscriptionError::Lagged(missed)),
            Err(RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    pub fn unsubscribe(self) {}
}

/// Sending side shared by backend implementations. Stamps each notification
/// with the next revision before broadcasting it.
#[derive(Debug, Clone)]
pub struct AuthNotifier {
    tx: broadcast::Sender<AuthNotification>,
    revision: Arc<AtomicU64>,
}

impl AuthNotifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx, revision: Arc::new(AtomicU64::new(0)) }
    }

    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.tx.subscribe())
    }

    /// Deliver `notification` to every live subscriber. Returns how many got it.
    pub fn emit(&self, mut notification: AuthNotification) -> usize {
        notification.revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is not an error; the notification is simply unobserved.
        self.tx.send(notification).unwrap_or(0)
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for AuthNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
