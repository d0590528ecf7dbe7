//! Core auth types — sessions, profiles, roles, and machine states.
//!
//! DESIGN
//! ======
//! `Session` is the identity the backend vouches for; `Profile` is the
//! authorization record looked up afterwards. They are kept separate so an
//! authenticated user whose profile could not be loaded is still representable
//! (`Authenticated { profile: None, .. }`), which the gate treats as having no
//! role at all.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::locale::Locale;

// =============================================================================
// SESSION
// =============================================================================

/// Authenticated principal as reported by the auth backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque account identifier, stable for the lifetime of the account.
    pub user_id: String,
    /// Email address (or handle) the account signs in with.
    pub email: String,
}

/// Email/password pair submitted to the backend.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self { email: email.into(), password: password.into() }
    }
}

/// Outcome of a successful account creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUp {
    /// The account exists and the backend opened a session for it.
    SignedIn(Session),
    /// The account exists but the backend holds no session until the email
    /// address is confirmed.
    ConfirmationPending(Session),
}

impl SignUp {
    /// The created account, whether or not it is signed in.
    #[must_use]
    pub fn account(&self) -> &Session {
        match self {
            Self::SignedIn(session) | Self::ConfirmationPending(session) => session,
        }
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn(_))
    }
}

// Passwords never reach logs through `{:?}`.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// ROLE
// =============================================================================

/// Roles recognised by the dashboard. Stored as snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ProductionOperator,
    ProductionEngineer,
    Owner,
    ReportingStaff,
    Administrator,
}

impl Role {
    pub const ALL: [Self; 5] = [
        Self::ProductionOperator,
        Self::ProductionEngineer,
        Self::Owner,
        Self::ReportingStaff,
        Self::Administrator,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProductionOperator => "production_operator",
            Self::ProductionEngineer => "production_engineer",
            Self::Owner => "owner",
            Self::ReportingStaff => "reporting_staff",
            Self::Administrator => "administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| UnknownRole(s.to_owned()))
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Authorization record keyed by `Session::user_id`. Mirrors the `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub preferred_language: Locale,
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Kind of change reported by the backend's auth notification stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

/// One entry of the notification stream: what happened and the session after it.
///
/// `revision` is stamped by the emitting backend and increases with every
/// notification it sends; 0 means the backend does not track revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthNotification {
    pub event: AuthEvent,
    pub session: Option<Session>,
    pub revision: u64,
}

impl AuthNotification {
    #[must_use]
    pub fn new(event: AuthEvent, session: Option<Session>) -> Self {
        Self { event, session, revision: 0 }
    }
}

// =============================================================================
// MACHINE STATE
// =============================================================================

/// Externally observable state of the session machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Loading,
    Authenticated {
        session: Session,
        profile: Option<Profile>,
    },
    Anonymous,
}

impl SessionState {
    /// True until the first session resolution has completed.
    #[must_use]
    pub fn loading(&self) -> bool {
        matches!(self, Self::Uninitialized | Self::Loading)
    }

    #[must_use]
    pub fn user(&self) -> Option<&Session> {
        match self {
            Self::Authenticated { session, .. } => Some(session),
            _ => None,
        }
    }

    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            Self::Authenticated { profile, .. } => profile.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.profile().map(|p| p.role)
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
