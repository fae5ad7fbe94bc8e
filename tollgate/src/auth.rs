//! The consumer-facing view of the session

use std::{fmt, sync::Arc};

use tollgate_clock::{Clock, System};

use crate::{
    gateway::{AuthGateway, AuthStatus, Credentials, Registration},
    AccessTokenRef, AuthError, Password, RefreshCoordinator, ResetTokenRef, Session,
    SessionStore, UserRecord,
};

/// The outcome of re-validating a session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStatus {
    /// Whether a session is still considered active
    pub authenticated: bool,
    /// The user the session belongs to
    pub user: Option<UserRecord>,
}

impl SessionStatus {
    fn unauthenticated() -> Self {
        Self {
            authenticated: false,
            user: None,
        }
    }

    fn authenticated(user: UserRecord) -> Self {
        Self {
            authenticated: true,
            user: Some(user),
        }
    }
}

/// Signs users in and out
///
/// Owns no transport logic: every server interaction is delegated to the
/// [`AuthGateway`], and every state change lands in the [`SessionStore`].
#[derive(Clone)]
pub struct AuthSession {
    gateway: Arc<dyn AuthGateway>,
    store: SessionStore,
    clock: Arc<dyn Clock + Send + Sync>,
    renewal: Option<RefreshCoordinator>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("store", &self.store)
            .field("renews", &self.renewal.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    /// Constructs a session facade using the system clock
    pub fn new(gateway: Arc<dyn AuthGateway>, store: SessionStore) -> Self {
        Self::with_clock(gateway, store, Arc::new(System))
    }

    /// Constructs a session facade using a custom clock
    pub fn with_clock(
        gateway: Arc<dyn AuthGateway>,
        store: SessionStore,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
            renewal: None,
        }
    }

    /// Renews the session through `coordinator` when a status check finds
    /// the access token rejected
    pub fn with_renewal(mut self, coordinator: RefreshCoordinator) -> Self {
        self.renewal = Some(coordinator);
        self
    }

    /// Signs in with email and password, replacing any current session
    #[tracing::instrument(err, skip(self, credentials), fields(email = %credentials.email, role = credentials.role.as_str()))]
    pub async fn login(&self, credentials: &Credentials) -> Result<UserRecord, AuthError> {
        let grant = self.gateway.login(credentials).await?;
        Ok(self.begin(Session::from_grant(grant, self.clock.now())).await)
    }

    /// Creates an account and signs in to it
    #[tracing::instrument(err, skip(self, registration), fields(email = %registration.email, role = registration.role.as_str()))]
    pub async fn signup(&self, registration: &Registration) -> Result<UserRecord, AuthError> {
        let grant = self.gateway.signup(registration).await?;
        Ok(self.begin(Session::from_grant(grant, self.clock.now())).await)
    }

    async fn begin(&self, session: Session) -> UserRecord {
        let user = session.user().clone();
        tracing::info!(
            user.id = %user.id,
            expires_at = session.expires_at().map(|t| t.0),
            has_refresh_token = session.refresh_token().is_some(),
            "signed in"
        );
        self.store.replace(session).await;
        user
    }

    /// Ends the session locally
    ///
    /// The server is told about it in the background; its answer is never
    /// waited on and does not matter.
    pub async fn logout(&self) {
        let Some(session) = self.store.current() else {
            tracing::debug!("no session to sign out of");
            return;
        };

        if self.store.clear().await {
            tracing::info!(user.id = %session.user().id, "signed out");
        }

        let gateway = self.gateway.clone();
        let token = session.access_token().to_owned();
        tokio::spawn(async move {
            if let Err(error) = gateway.logout(&token).await {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "server-side logout failed"
                );
            }
        });
    }

    /// The user of the current session
    pub fn current_user(&self) -> Option<UserRecord> {
        self.store.current().map(|s| s.user().clone())
    }

    /// Whether a session is present
    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Re-validates a resumed session with the server
    ///
    /// A rejected access token is renewed once, when the session can be
    /// renewed, and the check repeated with the new token. A second
    /// rejection, or a refused renewal, ends the session. If the server
    /// cannot be reached, or fails, the locally stored user is trusted
    /// instead.
    pub async fn check_status(&self) -> SessionStatus {
        let Some(session) = self.store.current() else {
            return SessionStatus::unauthenticated();
        };

        let mut token = session.access_token().to_owned();
        let mut outcome = self.gateway.status(&token).await;

        let renewable = matches!(outcome, Err(AuthError::Unauthorized { .. }))
            && session.refresh_token().is_some();
        if let Some(coordinator) = self.renewal.as_ref().filter(|_| renewable) {
            tracing::debug!("status check rejected the access token, renewing");
            outcome = match coordinator.obtain_fresh_token_after(&token).await {
                Ok(renewed) => {
                    token = renewed;
                    self.gateway.status(&token).await
                }
                Err(error) => Err(error),
            };
        }

        match outcome {
            Ok(AuthStatus { user: Some(user) }) => {
                self.refresh_user(&token, user.clone()).await;
                SessionStatus::authenticated(user)
            }
            Ok(AuthStatus { user: None }) | Err(AuthError::Unauthorized { .. }) => {
                tracing::info!("server no longer recognizes the session, signing out");
                self.store.clear().await;
                SessionStatus::unauthenticated()
            }
            Err(error) if error.is_terminal() => {
                tracing::info!(reason = %error, "session could not be renewed");
                self.store.clear().await;
                SessionStatus::unauthenticated()
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to re-validate session, trusting stored user"
                );
                SessionStatus::authenticated(session.user().clone())
            }
        }
    }

    async fn refresh_user(&self, validated: &AccessTokenRef, user: UserRecord) {
        match self.store.current() {
            Some(current) if current.access_token() == validated => {
                if current.user() != &user {
                    self.store.replace(current.with_user(user)).await;
                }
            }
            _ => tracing::debug!("session changed during status check, keeping it"),
        }
    }

    /// Asks the server to send a password reset email
    #[tracing::instrument(err, skip(self))]
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        self.gateway.forgot_password(email).await
    }

    /// Completes a password reset
    #[tracing::instrument(err, skip(self, token, new_password))]
    pub async fn reset_password(
        &self,
        token: &ResetTokenRef,
        new_password: &Password,
    ) -> Result<(), AuthError> {
        self.gateway.reset_password(token, new_password).await
    }

    /// Returns and forgets where the user was when their last session ended
    pub async fn take_redirect_target(&self) -> Option<String> {
        self.store.take_redirect_target().await
    }
}

#[cfg(test)]
mod tests {
    use tollgate_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{
        config::RedirectRules, gateway::ScriptedGateway, navigator::RecordingNavigator,
        storage::InMemoryStorage, Role, SessionTeardown, TerminalReason,
    };

    fn user() -> UserRecord {
        UserRecord {
            id: "u-3".into(),
            email: "old@example.com".into(),
            role: Role::Unknown,
            profile: None,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "kim@example.com".into(),
            password: Password::from_static("hunter2"),
            role: Role::School,
        }
    }

    async fn auth() -> (Arc<ScriptedGateway>, AuthSession) {
        let gateway = Arc::new(ScriptedGateway::new(user()));
        let store = SessionStore::open(InMemoryStorage::new()).await;
        let clock = TestClock::new(UnixTime(5_000));
        let session = AuthSession::with_clock(gateway.clone(), store, Arc::new(clock));
        (gateway, session)
    }

    struct Renewing {
        gateway: Arc<ScriptedGateway>,
        navigator: Arc<RecordingNavigator>,
        auth: AuthSession,
    }

    async fn renewing_auth() -> Renewing {
        let gateway = Arc::new(ScriptedGateway::new(user()));
        let store = SessionStore::open(InMemoryStorage::new()).await;
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(TestClock::new(UnixTime(5_000)));
        let navigator = Arc::new(RecordingNavigator::at("/classes"));
        let teardown =
            SessionTeardown::new(store.clone(), navigator.clone(), RedirectRules::default());
        let coordinator =
            RefreshCoordinator::with_clock(gateway.clone(), store.clone(), teardown, clock.clone());
        let auth = AuthSession::with_clock(gateway.clone(), store, clock).with_renewal(coordinator);
        auth.login(&credentials()).await.unwrap();

        Renewing {
            gateway,
            navigator,
            auth,
        }
    }

    #[tokio::test]
    async fn login_starts_session() {
        let (_, auth) = auth().await;

        let user = auth.login(&credentials()).await.unwrap();

        assert_eq!(user.email, "kim@example.com");
        assert_eq!(user.role, Role::School);
        assert!(auth.is_authenticated());
        assert_eq!(auth.current_user(), Some(user));

        let session = auth.store.current().unwrap();
        assert_eq!(session.access_token().as_str(), "access-1");
        assert_eq!(session.expires_at(), Some(UnixTime(5_000) + DurationSecs(3600)));
    }

    #[tokio::test]
    async fn failed_login_keeps_previous_state() {
        let (gateway, auth) = auth().await;
        gateway.fail_next_login(AuthError::Unauthorized {
            message: "wrong password".into(),
        });

        let err = auth.login(&credentials()).await.unwrap_err();

        assert_eq!(err.to_string(), "wrong password");
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn grant_without_token_is_terminal() {
        let (gateway, auth) = auth().await;
        gateway.fail_next_login(AuthError::terminal(TerminalReason::Error));

        let err = auth.login(&credentials()).await.unwrap_err();

        assert!(err.is_terminal());
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn signup_starts_session_with_profile() {
        let (_, auth) = auth().await;

        let user = auth
            .signup(&Registration {
                email: "new@example.com".into(),
                password: Password::from_static("pw"),
                role: Role::Parent,
                profile: Some(serde_json::json!({ "children": 2 })),
            })
            .await
            .unwrap();

        assert_eq!(user.role, Role::Parent);
        assert_eq!(auth.current_user().unwrap().profile, user.profile);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_locally_and_notifies_server() {
        let (gateway, auth) = auth().await;
        auth.login(&credentials()).await.unwrap();

        auth.logout().await;
        assert!(!auth.is_authenticated());
        assert_eq!(auth.current_user(), None);

        tokio::task::yield_now().await;
        assert_eq!(gateway.logout_calls(), 1);
    }

    #[tokio::test]
    async fn logout_without_session_is_noop() {
        let (gateway, auth) = auth().await;
        auth.logout().await;
        tokio::task::yield_now().await;
        assert_eq!(gateway.logout_calls(), 0);
    }

    #[tokio::test]
    async fn status_without_session_skips_network() {
        let (gateway, auth) = auth().await;

        assert_eq!(auth.check_status().await, SessionStatus::unauthenticated());
        assert_eq!(gateway.status_calls(), 0);
    }

    #[tokio::test]
    async fn status_confirms_session() {
        let (_, auth) = auth().await;
        let user = auth.login(&credentials()).await.unwrap();

        let status = auth.check_status().await;

        assert!(status.authenticated);
        assert_eq!(status.user, Some(user));
    }

    #[tokio::test]
    async fn rejected_status_without_renewal_signs_out() {
        let (gateway, auth) = auth().await;
        auth.login(&credentials()).await.unwrap();
        gateway.expire_access_token();

        let status = auth.check_status().await;

        assert_eq!(status, SessionStatus::unauthenticated());
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn rejected_status_is_renewed_and_rechecked() {
        let r = renewing_auth().await;
        r.gateway.expire_access_token();

        let status = r.auth.check_status().await;

        assert!(status.authenticated);
        assert_eq!(status.user.unwrap().email, "kim@example.com");
        assert_eq!(r.gateway.refresh_calls(), 1);
        assert_eq!(r.gateway.status_calls(), 2);
        assert_eq!(
            r.auth.store.current().unwrap().access_token().as_str(),
            "access-2"
        );
        assert!(r.navigator.visits().is_empty());
    }

    #[tokio::test]
    async fn refused_renewal_during_status_check_signs_out() {
        let r = renewing_auth().await;
        r.gateway.expire_access_token();
        r.gateway.revoke_refresh_token();

        let status = r.auth.check_status().await;

        assert_eq!(status, SessionStatus::unauthenticated());
        assert!(!r.auth.is_authenticated());
        assert_eq!(r.gateway.refresh_calls(), 1);
        assert_eq!(r.navigator.visits(), vec!["/login?session=expired".to_owned()]);
    }

    #[tokio::test]
    async fn second_rejection_after_renewal_signs_out() {
        let r = renewing_auth().await;
        r.gateway.fail_status_checks(Some(AuthError::Unauthorized {
            message: "account disabled".into(),
        }));

        let status = r.auth.check_status().await;

        assert_eq!(status, SessionStatus::unauthenticated());
        assert!(!r.auth.is_authenticated());
        assert_eq!(r.gateway.refresh_calls(), 1);
        assert_eq!(r.gateway.status_calls(), 2);
    }

    #[tokio::test]
    async fn transient_renewal_failure_trusts_stored_user() {
        let r = renewing_auth().await;
        r.gateway.expire_access_token();
        r.gateway.fail_next_refresh(AuthError::Server { status: 503 });

        let status = r.auth.check_status().await;

        assert!(status.authenticated);
        assert_eq!(status.user.unwrap().email, "kim@example.com");
        assert!(r.auth.is_authenticated());
        assert_eq!(r.gateway.status_calls(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_trusts_stored_user() {
        let (gateway, auth) = auth().await;
        let user = auth.login(&credentials()).await.unwrap();
        gateway.fail_status_checks(Some(AuthError::Network {
            detail: "offline".into(),
            timed_out: true,
        }));

        let status = auth.check_status().await;

        assert_eq!(status, SessionStatus::authenticated(user));
        assert!(auth.is_authenticated());
    }

    #[tokio::test]
    async fn server_error_trusts_stored_user() {
        let (gateway, auth) = auth().await;
        auth.login(&credentials()).await.unwrap();
        gateway.fail_status_checks(Some(AuthError::Server { status: 502 }));

        assert!(auth.check_status().await.authenticated);
        assert!(auth.is_authenticated());
    }

    #[tokio::test]
    async fn status_replaces_stale_user_record() {
        let gateway = Arc::new(ScriptedGateway::new(user()));
        let store = SessionStore::open(InMemoryStorage::new()).await;
        let auth = AuthSession::new(gateway.clone(), store.clone());
        auth.login(&credentials()).await.unwrap();

        let current = store.current().unwrap();
        store
            .replace(current.with_user(UserRecord {
                email: "outdated@example.com".into(),
                ..current.user().clone()
            }))
            .await;

        let status = auth.check_status().await;

        assert_eq!(status.user.unwrap().email, "kim@example.com");
        assert_eq!(auth.current_user().unwrap().email, "kim@example.com");
        assert_eq!(store.current().unwrap().access_token().as_str(), "access-1");
    }

    #[tokio::test]
    async fn redirect_target_is_taken_once() {
        let (_, auth) = auth().await;
        auth.store.set_redirect_target("/classes/7").await;

        assert_eq!(auth.take_redirect_target().await.as_deref(), Some("/classes/7"));
        assert_eq!(auth.take_redirect_target().await, None);
    }
}
