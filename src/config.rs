//! Configuration parsed from environment variables.

use std::time::Duration;

use crate::backend::supabase::SessionTokens;
use crate::locale::Locale;
use crate::types::Role;

pub const DEFAULT_APP_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_LOCALE_STORE_PATH: &str = ".authgate-locale.json";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const RESET_PASSWORD_PATH: &str = "/reset-password";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Settings applied by the session machine to every new account and reset mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Role assigned to profiles created at sign-up.
    pub default_role: Role,
    /// Language recorded on profiles created at sign-up.
    pub default_language: Locale,
    /// Where the password reset link lands.
    pub reset_redirect: String,
}

impl MachineConfig {
    #[must_use]
    pub fn for_origin(origin: &str) -> Self {
        Self {
            default_role: Role::ProductionOperator,
            default_language: Locale::En,
            reset_redirect: reset_redirect_for(origin),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::for_origin(DEFAULT_APP_ORIGIN)
    }
}

#[must_use]
pub fn reset_redirect_for(origin: &str) -> String {
    format!("{}{RESET_PASSWORD_PATH}", origin.trim_end_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub machine: MachineConfig,
    /// Tokens of a session saved by an earlier run, if any.
    pub session: Option<SessionTokens>,
    pub request_timeout: Duration,
}

impl AuthConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `SUPABASE_URL`
    /// - `SUPABASE_ANON_KEY`
    ///
    /// Optional:
    /// - `APP_ORIGIN`: default `http://localhost:5173`
    /// - `AUTH_DEFAULT_ROLE`: default `production_operator`
    /// - `AUTH_DEFAULT_LANGUAGE`: default `en`
    /// - `AUTH_REQUEST_TIMEOUT_SECS`: default 30
    /// - `SUPABASE_ACCESS_TOKEN`, `SUPABASE_REFRESH_TOKEN`: saved session
    ///   tokens; the refresh token requires the access token
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AuthConfig::from_env`] with an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`AuthConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let supabase_url = get("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?;
        if !supabase_url.starts_with("http://") && !supabase_url.starts_with("https://") {
            return Err(ConfigError::Invalid { var: "SUPABASE_URL", message: "expected an http(s) URL".into() });
        }
        let supabase_anon_key = get("SUPABASE_ANON_KEY").ok_or(ConfigError::Missing("SUPABASE_ANON_KEY"))?;
        let app_origin = get("APP_ORIGIN").unwrap_or_else(|| DEFAULT_APP_ORIGIN.to_owned());

        let default_role = match get("AUTH_DEFAULT_ROLE") {
            Some(raw) => raw
                .parse::<Role>()
                .map_err(|e| ConfigError::Invalid { var: "AUTH_DEFAULT_ROLE", message: e.to_string() })?,
            None => Role::ProductionOperator,
        };
        let default_language = match get("AUTH_DEFAULT_LANGUAGE") {
            Some(raw) => raw
                .parse::<Locale>()
                .map_err(|e| ConfigError::Invalid { var: "AUTH_DEFAULT_LANGUAGE", message: e.to_string() })?,
            None => Locale::En,
        };
        let request_timeout_secs = match get("AUTH_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    var: "AUTH_REQUEST_TIMEOUT_SECS",
                    message: format!("expected a positive integer, got {raw}"),
                })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };
        let refresh_token = get("SUPABASE_REFRESH_TOKEN");
        let session = match (get("SUPABASE_ACCESS_TOKEN"), refresh_token) {
            (Some(access_token), refresh_token) => Some(SessionTokens::new(access_token, refresh_token)),
            (None, Some(_)) => {
                return Err(ConfigError::Invalid {
                    var: "SUPABASE_REFRESH_TOKEN",
                    message: "requires SUPABASE_ACCESS_TOKEN".into(),
                });
            }
            (None, None) => None,
        };

        Ok(Self {
            supabase_url,
            supabase_anon_key,
            machine: MachineConfig {
                default_role,
                default_language,
                reset_redirect: reset_redirect_for(&app_origin),
            },
            session,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
