//! Error taxonomy surfaced by the session machine.
//!
//! ERROR HANDLING
//! ==============
//! `Credential` and `Backend` carry the backend's message verbatim so forms can
//! show it unchanged. `ProfileCreation` is a partial failure: the account
//! exists but has no usable profile, and callers must report it separately
//! from a rejected sign-up. `ProfileFetch` and `Subscription` are absorbed by
//! the machine and only logged.

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The backend rejected the credentials.
    #[error("{0}")]
    Credential(String),

    /// Account created, profile record not stored. Needs operator remediation.
    #[error("account {user_id} was created but its profile could not be stored: {message}")]
    ProfileCreation { user_id: String, message: String },

    /// Profile lookup failed after authentication. Never returned to callers.
    #[error("profile fetch failed for {user_id}: {message}")]
    ProfileFetch { user_id: String, message: String },

    /// Generic backend failure (sign-out, password reset, password update).
    #[error("{0}")]
    Backend(String),

    /// The notification stream failed. Never returned to callers.
    #[error("auth notification stream failed: {0}")]
    Subscription(String),

    #[error("session machine is already initialized")]
    AlreadyInitialized,

    #[error("session machine has been shut down")]
    ShutDown,
}

impl AuthError {
    /// Classify a backend failure from a credential operation: rejections are
    /// credential errors, transport and decode failures are backend errors.
    #[must_use]
    pub fn from_credential_failure(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(message) => Self::Credential(message),
            other => Self::Backend(other.to_string()),
        }
    }

    /// Any backend failure from a non-credential operation, message verbatim.
    #[must_use]
    pub fn from_backend_failure(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(message) => Self::Backend(message),
            other => Self::Backend(other.to_string()),
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
