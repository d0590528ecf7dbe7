//! authgate — session and authorization core for the production dashboard.
//!
//! ARCHITECTURE
//! ============
//! Identity, passwords, and session persistence belong to a hosted auth
//! backend reached through the `backend` traits. This crate keeps the
//! client-side view of that backend consistent: `machine` tracks who is signed
//! in and which profile (role) they have, and `gate` turns that state into a
//! render-or-redirect decision for protected routes.
//!
//! ```text
//! caller ──► SessionMachine ──► AuthBackend / ProfileStore
//!               ▲     │                  │
//!               │     └─ watch ──► Gate  │
//!               └──── notifications ◄────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod locale;
pub mod machine;
pub mod types;

pub use backend::{AuthBackend, BackendError, ProfileStore, StoreError, Subscription, SubscriptionError};
pub use config::{AuthConfig, ConfigError, MachineConfig};
pub use error::{AuthError, AuthResult};
pub use gate::{Access, Gate, LOGIN_PATH, UNAUTHORIZED_PATH, can_access};
pub use locale::{Locale, LocaleStore};
pub use machine::SessionMachine;
pub use types::{AuthEvent, AuthNotification, Credentials, Profile, Role, Session, SessionState, SignUp};
