use std::time::Duration;

use tokio::sync::broadcast;

use super::*;
use crate::backend::memory::MemoryBackend;
use crate::backend::{BackendError, StoreError};
use crate::gate::{LOGIN_PATH, UNAUTHORIZED_PATH};
use crate::locale::Locale;
use crate::types::{AuthEvent, AuthNotification};

// =============================================================================
// HELPERS
// =============================================================================

fn ana() -> Profile {
    Profile { id: "42".into(), name: "Ana".into(), role: Role::Owner, preferred_language: Locale::En }
}

fn session(user_id: &str, email: &str) -> Session {
    Session { user_id: user_id.into(), email: email.into() }
}

/// Backend with account 42 (`a@x.com` / `secret`) whose profile is Ana, owner.
fn seeded() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_account("42", "a@x.com", "secret");
    backend.put_profile(ana());
    backend
}

fn machine_for(backend: &Arc<MemoryBackend>) -> SessionMachine {
    SessionMachine::new(backend.clone(), backend.clone(), MachineConfig::default())
}

async fn started(backend: &Arc<MemoryBackend>) -> SessionMachine {
    let machine = machine_for(backend);
    machine.initialize().await.unwrap();
    machine
}

/// Let the reconciliation task and spawned resolutions run to quiescence.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// =============================================================================
// INITIALIZE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn uninitialized_machine_is_loading_and_pending() {
    let backend = seeded();
    let machine = machine_for(&backend);
    assert!(machine.loading());
    assert_eq!(machine.snapshot(), SessionState::Uninitialized);
    assert_eq!(machine.can_access(&[]), Access::Pending);
}

#[tokio::test(start_paused = true)]
async fn initialize_without_session_is_anonymous() {
    let backend = seeded();
    let machine = started(&backend).await;
    assert!(!machine.loading());
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
    assert_eq!(machine.can_access(&[]), Access::Redirect(LOGIN_PATH));
    assert_eq!(backend.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn initialize_restores_persisted_session_with_profile() {
    let backend = seeded();
    backend.restore_session(session("42", "a@x.com"));
    let machine = started(&backend).await;

    assert_eq!(machine.user(), Some(session("42", "a@x.com")));
    assert_eq!(machine.profile(), Some(ana()));
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Render);
}

#[tokio::test(start_paused = true)]
async fn initialize_stays_loading_until_profile_resolves() {
    let backend = seeded();
    backend.restore_session(session("42", "a@x.com"));
    let gate = backend.hold_profile_fetch("42");
    let machine = Arc::new(machine_for(&backend));

    let task = tokio::spawn({
        let machine = machine.clone();
        async move { machine.initialize().await }
    });
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Loading);
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Pending);

    gate.release();
    task.await.unwrap().unwrap();
    assert!(!machine.loading());
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Render);
}

#[tokio::test(start_paused = true)]
async fn failing_session_lookup_starts_anonymous() {
    let backend = seeded();
    backend.fail_get_session(BackendError::Transport("connection refused".into()));
    let machine = started(&backend).await;
    assert!(!machine.loading());
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn second_initialize_is_rejected() {
    let backend = seeded();
    let machine = started(&backend).await;
    assert_eq!(machine.initialize().await, Err(AuthError::AlreadyInitialized));
    assert_eq!(backend.subscriber_count(), 1);
}

// =============================================================================
// SIGN IN
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sign_in_owner_scenario() {
    let backend = seeded();
    let machine = started(&backend).await;

    let signed_in = machine.sign_in("a@x.com", "secret").await.unwrap();
    assert_eq!(signed_in.user_id, "42");
    assert_eq!(machine.profile().map(|p| p.name), Some("Ana".to_owned()));
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Render);
    assert_eq!(machine.can_access(&[Role::Administrator]), Access::Redirect(UNAUTHORIZED_PATH));
    assert_eq!(machine.can_access(&[]), Access::Render);
}

#[tokio::test(start_paused = true)]
async fn wrong_password_surfaces_credential_error() {
    let backend = seeded();
    let machine = started(&backend).await;

    let err = machine.sign_in("a@x.com", "wrong").await.unwrap_err();
    assert_eq!(err, AuthError::Credential("Invalid login credentials".into()));
    assert_eq!(err.to_string(), "Invalid login credentials");
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn session_is_never_exposed_before_profile_fetch() {
    let backend = seeded();
    let gate = backend.hold_profile_fetch("42");
    let machine = Arc::new(started(&backend).await);

    let task = tokio::spawn({
        let machine = machine.clone();
        async move { machine.sign_in("a@x.com", "secret").await }
    });
    settle().await;
    assert!(machine.user().is_none());
    assert!(backend.profile_fetches() >= 1);

    gate.release();
    task.await.unwrap().unwrap();
    assert_eq!(machine.profile(), Some(ana()));
}

#[tokio::test(start_paused = true)]
async fn failed_profile_fetch_keeps_user_without_role() {
    let backend = seeded();
    backend.fail_profile_fetch("42");
    let machine = started(&backend).await;

    machine.sign_in("a@x.com", "secret").await.unwrap();
    settle().await;
    assert!(machine.user().is_some());
    assert!(machine.profile().is_none());
    assert_eq!(machine.can_access(&[]), Access::Render);
    for role in Role::ALL {
        assert_eq!(machine.can_access(&[role]), Access::Redirect(UNAUTHORIZED_PATH));
    }
}

#[tokio::test(start_paused = true)]
async fn watch_receiver_sees_sign_in() {
    let backend = seeded();
    let machine = started(&backend).await;
    let mut rx = machine.watch();

    machine.sign_in("a@x.com", "secret").await.unwrap();
    let state = rx.wait_for(|s| s.user().is_some()).await.unwrap().clone();
    assert_eq!(state.role(), Some(Role::Owner));
}

// =============================================================================
// SIGN UP
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sign_up_creates_default_profile() {
    let backend = seeded();
    let machine = started(&backend).await;

    let outcome = machine.sign_up("new@x.com", "secret1", "Mehmet").await.unwrap();
    assert!(outcome.is_signed_in());
    let created = outcome.account();
    settle().await;

    let expected = Profile {
        id: created.user_id.clone(),
        name: "Mehmet".into(),
        role: Role::ProductionOperator,
        preferred_language: Locale::En,
    };
    assert_eq!(backend.profile(&created.user_id), Some(expected.clone()));
    assert_eq!(machine.profile(), Some(expected));
    assert_eq!(machine.can_access(&[Role::ProductionOperator]), Access::Render);
}

#[tokio::test(start_paused = true)]
async fn sign_up_uses_configured_defaults() {
    let backend = seeded();
    let config = MachineConfig {
        default_role: Role::ReportingStaff,
        default_language: Locale::Tr,
        ..MachineConfig::default()
    };
    let machine = SessionMachine::new(backend.clone(), backend.clone(), config);
    machine.initialize().await.unwrap();

    let outcome = machine.sign_up("new@x.com", "secret1", "Ayse").await.unwrap();
    let stored = backend.profile(&outcome.account().user_id).unwrap();
    assert_eq!(stored.role, Role::ReportingStaff);
    assert_eq!(stored.preferred_language, Locale::Tr);
}

#[tokio::test(start_paused = true)]
async fn sign_up_profile_failure_is_reported_distinctly() {
    let backend = seeded();
    backend.fail_profile_insert(StoreError::Backend(BackendError::Rejected("permission denied".into())));
    let machine = started(&backend).await;

    let err = machine.sign_up("new@x.com", "secret1", "Mehmet").await.unwrap_err();
    let AuthError::ProfileCreation { user_id, message } = &err else {
        panic!("expected ProfileCreation, got {err:?}");
    };
    assert_eq!(message, "permission denied");
    assert!(backend.has_account("new@x.com"));

    settle().await;
    assert_eq!(machine.user().map(|s| s.user_id), Some(user_id.clone()));
    assert!(machine.profile().is_none());
    assert_eq!(machine.can_access(&[Role::ProductionOperator]), Access::Redirect(UNAUTHORIZED_PATH));
}

#[tokio::test(start_paused = true)]
async fn sign_up_awaiting_confirmation_stays_signed_out() {
    let backend = seeded();
    backend.require_email_confirmation();
    let machine = started(&backend).await;

    let outcome = machine.sign_up("new@x.com", "secret1", "Mehmet").await.unwrap();
    let SignUp::ConfirmationPending(account) = &outcome else {
        panic!("expected pending confirmation, got {outcome:?}");
    };
    assert_eq!(account.email, "new@x.com");
    assert_eq!(backend.profile(&account.user_id).map(|p| p.role), Some(Role::ProductionOperator));

    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
    assert_eq!(machine.can_access(&[]), Access::Redirect(LOGIN_PATH));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_sign_up_with_failed_profile_stays_signed_out() {
    let backend = seeded();
    backend.require_email_confirmation();
    backend.fail_profile_insert(StoreError::Backend(BackendError::Rejected("permission denied".into())));
    let machine = started(&backend).await;

    let err = machine.sign_up("new@x.com", "secret1", "Mehmet").await.unwrap_err();
    assert!(matches!(err, AuthError::ProfileCreation { .. }));
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn rejected_sign_up_is_a_credential_error() {
    let backend = seeded();
    let machine = started(&backend).await;

    let err = machine.sign_up("a@x.com", "secret1", "Dup").await.unwrap_err();
    assert_eq!(err, AuthError::Credential("User already registered".into()));

    let err = machine.sign_up("b@x.com", "123", "Weak").await.unwrap_err();
    assert!(matches!(err, AuthError::Credential(_)));
    assert!(!backend.has_account("b@x.com"));
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

// =============================================================================
// SIGN OUT
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sign_out_redirects_every_route_to_login() {
    let backend = seeded();
    let machine = started(&backend).await;
    machine.sign_in("a@x.com", "secret").await.unwrap();

    machine.sign_out().await.unwrap();
    assert_eq!(machine.can_access(&[]), Access::Redirect(LOGIN_PATH));
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Redirect(LOGIN_PATH));

    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn queued_sign_in_notification_cannot_undo_sign_out() {
    let backend = seeded();
    let machine = started(&backend).await;

    // Both operations complete before the reconciler sees either notification.
    machine.sign_in("a@x.com", "secret").await.unwrap();
    machine.sign_out().await.unwrap();

    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
    assert_eq!(machine.can_access(&[]), Access::Redirect(LOGIN_PATH));
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_sign_out_keeps_session() {
    let backend = seeded();
    let machine = started(&backend).await;
    machine.sign_in("a@x.com", "secret").await.unwrap();
    backend.fail_sign_out(BackendError::Transport("offline".into()));

    let err = machine.sign_out().await.unwrap_err();
    assert_eq!(err, AuthError::Backend("auth backend unreachable: offline".into()));
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Render);
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn expired_session_signs_out() {
    let backend = seeded();
    let machine = started(&backend).await;
    machine.sign_in("a@x.com", "secret").await.unwrap();
    settle().await;

    backend.expire_session();
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn token_refresh_reloads_profile() {
    let backend = seeded();
    let machine = started(&backend).await;
    machine.sign_in("a@x.com", "secret").await.unwrap();
    settle().await;

    backend.put_profile(Profile { role: Role::Administrator, ..ana() });
    backend.refresh_session();
    settle().await;
    assert_eq!(machine.can_access(&[Role::Administrator]), Access::Render);
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Redirect(UNAUTHORIZED_PATH));
}

#[tokio::test(start_paused = true)]
async fn notification_from_elsewhere_signs_in() {
    let backend = seeded();
    let machine = started(&backend).await;

    backend.emit(AuthNotification::new(AuthEvent::SignedIn, Some(session("42", "a@x.com"))));
    settle().await;
    assert_eq!(machine.profile(), Some(ana()));
}

#[tokio::test(start_paused = true)]
async fn slow_resolution_of_older_notification_is_discarded() {
    let backend = seeded();
    backend.put_profile(Profile { id: "7".into(), name: "Bora".into(), role: Role::Administrator, ..ana() });
    let machine = started(&backend).await;
    let gate = backend.hold_profile_fetch("42");

    backend.emit(AuthNotification::new(AuthEvent::SignedIn, Some(session("42", "a@x.com"))));
    backend.emit(AuthNotification::new(AuthEvent::SignedIn, Some(session("7", "b@x.com"))));
    settle().await;
    assert_eq!(machine.user().map(|s| s.user_id), Some("7".to_owned()));

    gate.release();
    settle().await;
    assert_eq!(machine.user().map(|s| s.user_id), Some("7".to_owned()));
    assert_eq!(machine.can_access(&[Role::Administrator]), Access::Render);
}

#[tokio::test(start_paused = true)]
async fn slow_sign_in_loses_to_later_expiry() {
    let backend = seeded();
    let gate = backend.hold_profile_fetch("42");
    let machine = Arc::new(started(&backend).await);

    let task = tokio::spawn({
        let machine = machine.clone();
        async move { machine.sign_in("a@x.com", "secret").await }
    });
    settle().await;
    backend.expire_session();
    settle().await;

    gate.release();
    assert!(task.await.unwrap().is_ok());
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn lagging_stream_fails_closed_then_resynchronises() {
    let backend = seeded();
    let machine = started(&backend).await;
    machine.sign_in("a@x.com", "secret").await.unwrap();
    settle().await;

    let gate = backend.hold_profile_fetch("42");
    for _ in 0..20 {
        backend.refresh_session();
    }
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);

    gate.release();
    settle().await;
    assert_eq!(machine.profile(), Some(ana()));
}

// =============================================================================
// STREAM WITHOUT REVISIONS
// =============================================================================

/// Backend whose notification stream the test drives and can close.
struct StreamBackend {
    session: Option<Session>,
    tx: Mutex<Option<broadcast::Sender<AuthNotification>>>,
}

impl StreamBackend {
    fn new(session: Option<Session>) -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { session, tx: Mutex::new(Some(tx)) }
    }

    fn send(&self, notification: AuthNotification) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            tx.send(notification).unwrap();
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

fn unsupported() -> BackendError {
    BackendError::Rejected("unsupported".into())
}

#[async_trait::async_trait]
impl AuthBackend for StreamBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        Ok(self.session.clone())
    }

    async fn sign_in_with_password(&self, _credentials: &Credentials) -> Result<Session, BackendError> {
        Err(unsupported())
    }

    async fn sign_up(&self, _credentials: &Credentials, _name: &str) -> Result<SignUp, BackendError> {
        Err(unsupported())
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        Err(unsupported())
    }

    async fn reset_password_for_email(&self, _email: &str, _redirect_to: &str) -> Result<(), BackendError> {
        Err(unsupported())
    }

    async fn update_password(&self, _new_password: &str) -> Result<(), BackendError> {
        Err(unsupported())
    }

    fn subscribe(&self) -> Subscription {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => Subscription::new(tx.subscribe()),
            None => Subscription::new(broadcast::channel(1).1),
        }
    }
}

async fn stream_machine() -> (Arc<StreamBackend>, SessionMachine) {
    let stream = Arc::new(StreamBackend::new(Some(session("42", "a@x.com"))));
    let machine = SessionMachine::new(stream.clone(), seeded(), MachineConfig::default());
    machine.initialize().await.unwrap();
    (stream, machine)
}

#[tokio::test(start_paused = true)]
async fn unstamped_notifications_apply_in_arrival_order() {
    let (stream, machine) = stream_machine().await;
    assert_eq!(machine.profile(), Some(ana()));

    stream.send(AuthNotification::new(AuthEvent::SignedOut, None));
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);

    stream.send(AuthNotification::new(AuthEvent::SignedIn, Some(session("42", "a@x.com"))));
    settle().await;
    assert_eq!(machine.can_access(&[Role::Owner]), Access::Render);
}

#[tokio::test(start_paused = true)]
async fn closed_stream_drops_cached_session() {
    let (stream, machine) = stream_machine().await;
    assert!(machine.user().is_some());

    stream.close();
    settle().await;
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
    assert_eq!(machine.can_access(&[]), Access::Redirect(LOGIN_PATH));
}

#[tokio::test(start_paused = true)]
async fn non_credential_failures_are_backend_errors() {
    let (_stream, machine) = stream_machine().await;
    assert_eq!(machine.sign_out().await, Err(AuthError::Backend("unsupported".into())));
    assert_eq!(
        AuthError::from_credential_failure(BackendError::Transport("timeout".into())),
        AuthError::Backend("auth backend unreachable: timeout".into())
    );
    // Cached state survives a refused sign-out.
    assert!(machine.user().is_some());
}

// =============================================================================
// PASSWORDS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reset_password_uses_configured_redirect() {
    let backend = seeded();
    let machine = started(&backend).await;

    machine.reset_password("a@x.com").await.unwrap();
    assert_eq!(
        backend.reset_requests(),
        vec![("a@x.com".to_owned(), "http://localhost:5173/reset-password".to_owned())]
    );
}

#[tokio::test(start_paused = true)]
async fn reset_password_failure_carries_backend_message() {
    let backend = seeded();
    backend.fail_reset_password(BackendError::Rejected("Email rate limit exceeded".into()));
    let machine = started(&backend).await;

    let err = machine.reset_password("a@x.com").await.unwrap_err();
    assert_eq!(err, AuthError::Backend("Email rate limit exceeded".into()));
}

#[tokio::test(start_paused = true)]
async fn update_password_for_signed_in_user() {
    let backend = seeded();
    let machine = started(&backend).await;
    machine.sign_in("a@x.com", "secret").await.unwrap();

    machine.update_password("brand-new").await.unwrap();
    assert_eq!(backend.password_of("a@x.com").as_deref(), Some("brand-new"));
    settle().await;
    assert_eq!(machine.profile(), Some(ana()));
}

#[tokio::test(start_paused = true)]
async fn update_password_without_session_fails() {
    let backend = seeded();
    let machine = started(&backend).await;
    let err = machine.update_password("brand-new").await.unwrap_err();
    assert_eq!(err, AuthError::Backend("Auth session missing!".into()));
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_unsubscribes_and_rejects_operations() {
    let backend = seeded();
    let machine = started(&backend).await;

    machine.shutdown();
    machine.shutdown();
    settle().await;
    assert!(machine.is_shut_down());
    assert_eq!(backend.subscriber_count(), 0);
    assert_eq!(machine.sign_in("a@x.com", "secret").await, Err(AuthError::ShutDown));
    assert_eq!(machine.initialize().await, Err(AuthError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn resolution_finishing_after_shutdown_is_discarded() {
    let backend = seeded();
    let gate = backend.hold_profile_fetch("42");
    let machine = Arc::new(started(&backend).await);

    let task = tokio::spawn({
        let machine = machine.clone();
        async move { machine.sign_in("a@x.com", "secret").await }
    });
    settle().await;
    machine.shutdown();

    gate.release();
    assert!(task.await.unwrap().is_ok());
    assert_eq!(machine.snapshot(), SessionState::Anonymous);
}

#[tokio::test(start_paused = true)]
async fn dropping_machine_unsubscribes() {
    let backend = seeded();
    let machine = started(&backend).await;
    assert_eq!(backend.subscriber_count(), 1);

    drop(machine);
    settle().await;
    assert_eq!(backend.subscriber_count(), 0);
}
