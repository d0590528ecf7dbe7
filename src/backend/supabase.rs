//! Supabase client — GoTrue auth endpoints and the PostgREST `profiles` table.
//!
//! DESIGN
//! ======
//! Thin HTTP wrapper in the shape of the hosted JS SDK: tokens from the last
//! sign-in are kept in memory, requests carry them as bearer credentials
//! (falling back to the anon key), and every session change is broadcast to
//! subscribers. Tokens saved by an earlier run can be handed back with
//! `with_session`; `get_session` then validates them and refreshes an expired
//! access token once before giving up. Response parsing and status mapping
//! are split into pure functions for testability.
//!
//! ERROR HANDLING
//! ==============
//! 4xx responses become `BackendError::Rejected` with the server's own
//! message; 5xx and network failures become `Transport`; bodies that do not
//! match the expected shape become `Decode`.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use super::{AuthBackend, AuthNotifier, BackendError, ProfileStore, StoreError, Subscription};
use crate::types::{AuthEvent, AuthNotification, Credentials, Profile, Session, SignUp};

const PROFILES_TABLE: &str = "profiles";
const PGRST_SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// TOKENS
// =============================================================================

/// Bearer credentials of a signed-in account.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl SessionTokens {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token }
    }
}

// Tokens never reach logs through `{:?}`.
impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct SupabaseClient {
    http: reqwest::Client,
    api_url: String,
    anon_key: String,
    tokens: Mutex<Option<SessionTokens>>,
    notifier: AuthNotifier,
}

impl SupabaseClient {
    /// Build a client for the project at `api_url` (e.g. `https://xyz.supabase.co`).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Transport`] if the HTTP client cannot be built.
    pub fn new(api_url: &str, anon_key: impl Into<String>, request_timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self::with_http(http, api_url, anon_key))
    }

    fn with_http(http: reqwest::Client, api_url: &str, anon_key: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_owned(),
            anon_key: anon_key.into(),
            tokens: Mutex::new(None),
            notifier: AuthNotifier::new(),
        }
    }

    /// Start from tokens saved by an earlier run. They are validated by the
    /// next `get_session` call.
    #[must_use]
    pub fn with_session(self, tokens: SessionTokens) -> Self {
        self.store(Some(tokens));
        self
    }

    /// Tokens currently held, for callers that persist them between runs.
    #[must_use]
    pub fn tokens(&self) -> Option<SessionTokens> {
        self.held().clone()
    }

    fn held(&self) -> MutexGuard<'_, Option<SessionTokens>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.api_url, path)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_url, table)
    }

    /// Bearer credential: the signed-in user's access token, else the anon key.
    fn bearer(&self) -> String {
        let token = self
            .held()
            .as_ref()
            .map_or_else(|| self.anon_key.clone(), |t| t.access_token.clone());
        format!("Bearer {token}")
    }

    fn access_token(&self) -> Option<String> {
        self.held().as_ref().map(|t| t.access_token.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.held().as_ref().and_then(|t| t.refresh_token.clone())
    }

    fn with_headers(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", self.bearer())
    }

    fn store(&self, tokens: Option<SessionTokens>) {
        *self.held() = tokens;
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Rejected`] if no refresh token is held or the
    /// backend refuses it.
    pub async fn refresh_session(&self) -> Result<Session, BackendError> {
        let refresh_token = self
            .refresh_token()
            .ok_or_else(|| BackendError::Rejected("Auth session missing!".into()))?;

        let req = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        let (_, body) = send(req).await?;
        let (session, tokens) = parse_token_body(&body)?;
        self.store(Some(tokens));

        tracing::debug!(user_id = %session.user_id, "supabase session refreshed");
        self.notifier
            .emit(AuthNotification::new(AuthEvent::TokenRefreshed, Some(session.clone())));
        Ok(session)
    }

    /// Refresh after the access token was refused. A refused refresh token
    /// ends the session; transport failures keep the tokens for a later try.
    async fn recover_expired(&self) -> Result<Option<Session>, BackendError> {
        if self.refresh_token().is_none() {
            tracing::info!("stored supabase session expired and cannot be refreshed");
            self.store(None);
            return Ok(None);
        }
        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(BackendError::Rejected(message)) => {
                tracing::info!(%message, "supabase refresh token refused");
                self.store(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct UserBody {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct TokenBody {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: UserBody,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<UserBody> for Session {
    fn from(user: UserBody) -> Self {
        Self { user_id: user.id, email: user.email.unwrap_or_default() }
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Pull a human-readable message out of a GoTrue or PostgREST error body.
fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
        .msg
        .or(parsed.error_description)
        .or(parsed.message)
        .or(parsed.error)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("request failed with status {}", status.as_u16()))
}

fn classify_failure(status: StatusCode, body: &str) -> BackendError {
    let message = error_message(status, body);
    if status.is_server_error() {
        BackendError::Transport(format!("{}: {message}", status.as_u16()))
    } else {
        BackendError::Rejected(message)
    }
}

fn parse_token_body(body: &str) -> Result<(Session, SessionTokens), BackendError> {
    let token: TokenBody = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok((token.user.into(), SessionTokens::new(token.access_token, token.refresh_token)))
}

/// Sign-up answers with a full session when email confirmation is disabled
/// and with the bare user object when confirmation is pending.
fn parse_signup_body(body: &str) -> Result<(Session, Option<SessionTokens>), BackendError> {
    if let Ok((session, tokens)) = parse_token_body(body) {
        return Ok((session, Some(tokens)));
    }
    let user: UserBody = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok((user.into(), None))
}

fn parse_user_body(body: &str) -> Result<Session, BackendError> {
    let user: UserBody = serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok(user.into())
}

fn parse_profile_body(body: &str) -> Result<Profile, BackendError> {
    serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))
}

// =============================================================================
// STATUS MAPPING
// =============================================================================

/// Answer of `GET /auth/v1/user` for the held access token.
#[derive(Debug, PartialEq, Eq)]
enum UserCheck {
    Valid(Session),
    Expired,
}

fn user_check(status: StatusCode, body: &str) -> Result<UserCheck, BackendError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Ok(UserCheck::Expired);
    }
    if !status.is_success() {
        return Err(classify_failure(status, body));
    }
    Ok(UserCheck::Valid(parse_user_body(body)?))
}

/// An already-revoked token still counts as signed out.
fn logout_outcome(status: StatusCode, body: &str) -> Result<(), BackendError> {
    if status.is_success() || status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    Err(classify_failure(status, body))
}

/// PostgREST answers a single-object request matching zero rows with 406.
fn profile_select_outcome(status: StatusCode, body: &str) -> Result<Profile, StoreError> {
    if status == StatusCode::NOT_ACCEPTABLE {
        return Err(StoreError::NotFound);
    }
    if !status.is_success() {
        return Err(classify_failure(status, body).into());
    }
    Ok(parse_profile_body(body)?)
}

fn profile_insert_outcome(status: StatusCode, body: &str) -> Result<(), StoreError> {
    if status == StatusCode::CONFLICT {
        return Err(StoreError::Conflict(error_message(status, body)));
    }
    if !status.is_success() {
        return Err(classify_failure(status, body).into());
    }
    Ok(())
}

/// Send `req`, returning status and body of a successful response.
async fn send(req: RequestBuilder) -> Result<(StatusCode, String), BackendError> {
    let (status, body) = send_raw(req).await?;
    if !status.is_success() {
        return Err(classify_failure(status, &body));
    }
    Ok((status, body))
}

async fn send_raw(req: RequestBuilder) -> Result<(StatusCode, String), BackendError> {
    let resp = req.send().await.map_err(|e| BackendError::Transport(e.to_string()))?;
    let status = resp.status();
    let body = resp.text().await.map_err(|e| BackendError::Transport(e.to_string()))?;
    Ok((status, body))
}

// =============================================================================
// AUTH BACKEND
// =============================================================================

#[async_trait::async_trait]
impl AuthBackend for SupabaseClient {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        if self.access_token().is_none() {
            return Ok(None);
        }

        let req = self.with_headers(self.http.get(self.auth_url("user")));
        let (status, body) = send_raw(req).await?;
        match user_check(status, &body)? {
            UserCheck::Valid(session) => Ok(Some(session)),
            UserCheck::Expired => self.recover_expired().await,
        }
    }

    async fn sign_in_with_password(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        let req = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            }));
        let (_, body) = send(req).await?;
        let (session, tokens) = parse_token_body(&body)?;
        self.store(Some(tokens));

        self.notifier
            .emit(AuthNotification::new(AuthEvent::SignedIn, Some(session.clone())));
        Ok(session)
    }

    async fn sign_up(&self, credentials: &Credentials, name: &str) -> Result<SignUp, BackendError> {
        let req = self
            .http
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
                "data": { "name": name },
            }));
        let (_, body) = send(req).await?;
        let (session, tokens) = parse_signup_body(&body)?;

        let Some(tokens) = tokens else {
            tracing::info!(user_id = %session.user_id, "sign-up pending email confirmation");
            return Ok(SignUp::ConfirmationPending(session));
        };
        self.store(Some(tokens));
        self.notifier
            .emit(AuthNotification::new(AuthEvent::SignedIn, Some(session.clone())));
        Ok(SignUp::SignedIn(session))
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        if self.access_token().is_some() {
            let req = self.with_headers(self.http.post(self.auth_url("logout")));
            let (status, body) = send_raw(req).await?;
            logout_outcome(status, &body)?;
        }
        self.store(None);
        self.notifier.emit(AuthNotification::new(AuthEvent::SignedOut, None));
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str, redirect_to: &str) -> Result<(), BackendError> {
        let req = self
            .http
            .post(self.auth_url("recover"))
            .query(&[("redirect_to", redirect_to)])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email }));
        send(req).await?;
        Ok(())
    }

    async fn update_password(&self, new_password: &str) -> Result<(), BackendError> {
        if self.access_token().is_none() {
            return Err(BackendError::Rejected("Auth session missing!".into()));
        }

        let req = self
            .with_headers(self.http.put(self.auth_url("user")))
            .json(&serde_json::json!({ "password": new_password }));
        let (_, body) = send(req).await?;
        let session = parse_user_body(&body)?;

        self.notifier
            .emit(AuthNotification::new(AuthEvent::UserUpdated, Some(session)));
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    fn revision(&self) -> u64 {
        self.notifier.revision()
    }
}

// =============================================================================
// PROFILE STORE
// =============================================================================

#[async_trait::async_trait]
impl ProfileStore for SupabaseClient {
    async fn select_by_id(&self, user_id: &str) -> Result<Profile, StoreError> {
        let req = self
            .with_headers(self.http.get(self.rest_url(PROFILES_TABLE)))
            .query(&[("id", format!("eq.{user_id}")), ("select", "*".to_owned())])
            .header("Accept", PGRST_SINGLE_OBJECT);
        let (status, body) = send_raw(req).await?;
        profile_select_outcome(status, &body)
    }

    async fn insert(&self, profile: &Profile) -> Result<(), StoreError> {
        let req = self
            .with_headers(self.http.post(self.rest_url(PROFILES_TABLE)))
            .header("Prefer", "return=minimal")
            .json(&[profile]);
        let (status, body) = send_raw(req).await?;
        profile_insert_outcome(status, &body)
    }
}

#[cfg(test)]
#[path = "supabase_test.rs"]
mod tests;
