//! Authorization gate — decides whether a protected route renders.
//!
//! SYSTEM CONTEXT
//! ==============
//! Route guards call this with the current machine state and the roles a route
//! admits. The gate never reports errors, it only renders or redirects. An
//! authenticated user without a profile holds no role, so every role-gated
//! route sends them to `/unauthorized`.

use crate::types::{Role, SessionState};

pub const LOGIN_PATH: &str = "/login";
pub const UNAUTHORIZED_PATH: &str = "/unauthorized";

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The first session check is still running; render nothing yet.
    Pending,
    Render,
    Redirect(&'static str),
}

impl Access {
    #[must_use]
    pub fn is_render(self) -> bool {
        matches!(self, Self::Render)
    }

    #[must_use]
    pub fn redirect_target(self) -> Option<&'static str> {
        match self {
            Self::Redirect(path) => Some(path),
            _ => None,
        }
    }
}

/// Decide access for `state`. Empty `allowed_roles` means any signed-in user.
#[must_use]
pub fn can_access(state: &SessionState, allowed_roles: &[Role]) -> Access {
    if state.loading() {
        return Access::Pending;
    }
    if state.user().is_none() {
        return Access::Redirect(LOGIN_PATH);
    }
    if allowed_roles.is_empty() {
        return Access::Render;
    }
    match state.role() {
        Some(role) if allowed_roles.contains(&role) => Access::Render,
        _ => Access::Redirect(UNAUTHORIZED_PATH),
    }
}

/// A reusable guard for one route, holding the roles it admits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gate {
    allowed_roles: Vec<Role>,
}

impl Gate {
    /// Guard that only requires a signed-in user.
    #[must_use]
    pub fn authenticated() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn roles(allowed_roles: impl IntoIterator<Item = Role>) -> Self {
        Self { allowed_roles: allowed_roles.into_iter().collect() }
    }

    #[must_use]
    pub fn allowed_roles(&self) -> &[Role] {
        &self.allowed_roles
    }

    #[must_use]
    pub fn check(&self, state: &SessionState) -> Access {
        can_access(state, &self.allowed_roles)
    }
}

#[cfg(test)]
#[path = "gate_test.rs"]
mod tests;
