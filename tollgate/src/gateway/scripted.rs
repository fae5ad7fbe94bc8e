//! An in-memory authorization server for tests and demos

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use tollgate_clock::DurationSecs;

use super::{AuthGateway, AuthGrant, AuthStatus, Credentials, RefreshGrant, Registration};
use crate::{
    AccessToken, AccessTokenRef, AuthError, Password, RefreshToken, RefreshTokenRef,
    ResetTokenRef, TerminalReason, UserRecord,
};

/// An authorization server simulated in memory
///
/// Tokens are issued as `access-<n>` and `refresh-<n>`. Only the most
/// recently issued access token is considered valid, which lets a fake
/// resource server answer `401` for anything older. Refreshes may be delayed
/// and scripted to fail, and every call is counted.
#[derive(Debug)]
pub struct ScriptedGateway {
    state: Mutex<ScriptState>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

#[derive(Debug)]
struct ScriptState {
    user: UserRecord,
    issued: u64,
    lifetime: Option<DurationSecs>,
    rotate_refresh_tokens: bool,
    refresh_delay: Duration,
    refresh_failures: VecDeque<AuthError>,
    login_failure: Option<AuthError>,
    status_failure: Option<AuthError>,
    valid_access: Option<AccessToken>,
    valid_refresh: Option<RefreshToken>,
}

impl ScriptedGateway {
    /// Constructs a server that signs everyone in as `user`
    ///
    /// Tokens are issued with a one-hour lifetime and non-rotating refresh
    /// tokens.
    pub fn new(user: UserRecord) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                user,
                issued: 0,
                lifetime: Some(DurationSecs(3600)),
                rotate_refresh_tokens: false,
                refresh_delay: Duration::ZERO,
                refresh_failures: VecDeque::new(),
                login_failure: None,
                status_failure: None,
                valid_access: None,
                valid_refresh: None,
            }),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    /// Sets the lifetime reported for issued access tokens; `None` issues
    /// non-expiring tokens
    pub fn with_lifetime(self, lifetime: Option<DurationSecs>) -> Self {
        self.state().lifetime = lifetime;
        self
    }

    /// Issues a new refresh token on every refresh
    pub fn with_rotating_refresh_tokens(self) -> Self {
        self.state().rotate_refresh_tokens = true;
        self
    }

    /// Delays every refresh by `delay` before answering
    pub fn with_refresh_delay(self, delay: Duration) -> Self {
        self.state().refresh_delay = delay;
        self
    }

    /// Makes the next refresh fail with `error`; failures queue up in order
    pub fn fail_next_refresh(&self, error: AuthError) {
        self.state().refresh_failures.push_back(error);
    }

    /// Makes the next login or signup fail with `error`
    pub fn fail_next_login(&self, error: AuthError) {
        self.state().login_failure = Some(error);
    }

    /// Makes every status check fail with `error` until cleared with `None`
    pub fn fail_status_checks(&self, error: Option<AuthError>) {
        self.state().status_failure = error;
    }

    /// Revokes the refresh token, as if it had expired server-side
    pub fn revoke_refresh_token(&self) {
        self.state().valid_refresh = None;
    }

    /// Invalidates the current access token, as if it had expired server-side
    pub fn expire_access_token(&self) {
        self.state().valid_access = None;
    }

    /// Whether `token` is the currently valid access token
    pub fn accepts(&self, token: &AccessTokenRef) -> bool {
        self.state().valid_access.as_deref() == Some(token)
    }

    /// Number of login and signup calls received
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::Acquire)
    }

    /// Number of refresh calls received
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::Acquire)
    }

    /// Number of logout calls received
    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::Acquire)
    }

    /// Number of status checks received
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue_grant(&self, user: Option<UserRecord>) -> Result<AuthGrant, AuthError> {
        let mut state = self.state();
        if let Some(error) = state.login_failure.take() {
            return Err(error);
        }

        state.issued += 1;
        let token = AccessToken::new(format!("access-{}", state.issued));
        let refresh_token = RefreshToken::new(format!("refresh-{}", state.issued));
        state.valid_access = Some(token.clone());
        state.valid_refresh = Some(refresh_token.clone());
        if let Some(user) = user {
            state.user = user;
        }

        Ok(AuthGrant {
            token,
            refresh_token: Some(refresh_token),
            expires_in: state.lifetime,
            user: state.user.clone(),
        })
    }
}

#[async_trait]
impl AuthGateway for ScriptedGateway {
    async fn login(&self, credentials: &Credentials) -> Result<AuthGrant, AuthError> {
        self.login_calls.fetch_add(1, Ordering::AcqRel);
        let user = {
            let state = self.state();
            UserRecord {
                email: credentials.email.clone(),
                role: credentials.role,
                ..state.user.clone()
            }
        };
        self.issue_grant(Some(user))
    }

    async fn signup(&self, registration: &Registration) -> Result<AuthGrant, AuthError> {
        self.login_calls.fetch_add(1, Ordering::AcqRel);
        let user = {
            let state = self.state();
            UserRecord {
                email: registration.email.clone(),
                role: registration.role,
                profile: registration.profile.clone(),
                ..state.user.clone()
            }
        };
        self.issue_grant(Some(user))
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<RefreshGrant, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::AcqRel);

        let delay = self.state().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(error) = state.refresh_failures.pop_front() {
            return Err(error);
        }

        if state.valid_refresh.as_deref() != Some(refresh_token) {
            return Err(AuthError::terminal(TerminalReason::Expired));
        }

        state.issued += 1;
        let token = AccessToken::new(format!("access-{}", state.issued));
        state.valid_access = Some(token.clone());

        let refresh_token = if state.rotate_refresh_tokens {
            let rotated = RefreshToken::new(format!("refresh-{}", state.issued));
            state.valid_refresh = Some(rotated.clone());
            Some(rotated)
        } else {
            None
        };

        Ok(RefreshGrant {
            token,
            refresh_token,
            expires_in: state.lifetime,
        })
    }

    async fn logout(&self, _: &AccessTokenRef) -> Result<(), AuthError> {
        self.logout_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn status(&self, access_token: &AccessTokenRef) -> Result<AuthStatus, AuthError> {
        self.status_calls.fetch_add(1, Ordering::AcqRel);
        let state = self.state();
        if let Some(error) = state.status_failure.clone() {
            return Err(error);
        }

        if state.valid_access.as_deref() == Some(access_token) {
            Ok(AuthStatus {
                user: Some(state.user.clone()),
            })
        } else {
            Err(AuthError::Unauthorized {
                message: "token not accepted".into(),
            })
        }
    }

    async fn forgot_password(&self, _: &str) -> Result<(), AuthError> {
        Ok(())
    }

    async fn reset_password(&self, _: &ResetTokenRef, _: &Password) -> Result<(), AuthError> {
        Ok(())
    }
}
