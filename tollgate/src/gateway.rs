//! The authorization server, as seen by the session subsystem

use async_trait::async_trait;
use tollgate_clock::DurationSecs;

use crate::{
    AccessToken, AccessTokenRef, AuthError, Password, RefreshToken, RefreshTokenRef,
    ResetTokenRef, Role, UserRecord,
};

mod dto;
#[cfg(feature = "http")]
pub mod http;
pub mod scripted;

#[cfg(feature = "http")]
pub use self::http::HttpAuthGateway;
pub use scripted::ScriptedGateway;

/// The header marking a request as exempt from refresh-and-retry handling
pub const SKIP_AUTH_REFRESH_HEADER: &str = "x-skip-auth-refresh";

/// Credentials for an email/password login
#[derive(Clone, Debug)]
pub struct Credentials {
    /// The account email
    pub email: String,
    /// The account password
    pub password: Password,
    /// The role being signed in as
    pub role: Role,
}

/// Details for a new account
#[derive(Clone, Debug)]
pub struct Registration {
    /// The account email
    pub email: String,
    /// The chosen password
    pub password: Password,
    /// The role the account acts under
    pub role: Role,
    /// Optional free-form profile data
    pub profile: Option<serde_json::Value>,
}

/// The tokens and user issued by a successful login or signup
#[derive(Clone, Debug)]
pub struct AuthGrant {
    /// The access token
    pub token: AccessToken,
    /// The refresh token, if issued
    pub refresh_token: Option<RefreshToken>,
    /// How long the access token is valid for, if it expires
    pub expires_in: Option<DurationSecs>,
    /// The authenticated user
    pub user: UserRecord,
}

/// The tokens issued by a successful refresh
#[derive(Clone, Debug)]
pub struct RefreshGrant {
    /// The new access token
    pub token: AccessToken,
    /// A rotated refresh token, if the server rotates them
    pub refresh_token: Option<RefreshToken>,
    /// How long the new access token is valid for, if it expires
    pub expires_in: Option<DurationSecs>,
}

/// The server's view of a resumed session
#[derive(Clone, Debug, PartialEq)]
pub struct AuthStatus {
    /// The user the presented token belongs to, if it is still accepted
    pub user: Option<UserRecord>,
}

/// Transport to the authorization server
///
/// Implementations map every failure into the [`AuthError`] taxonomy. In
/// particular, a success response that lacks a token is a terminal error, and
/// a refresh rejected by the server is terminal with reason `expired`.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Signs in with email and password
    async fn login(&self, credentials: &Credentials) -> Result<AuthGrant, AuthError>;

    /// Creates an account and signs in to it
    async fn signup(&self, registration: &Registration) -> Result<AuthGrant, AuthError>;

    /// Exchanges a refresh token for a new access token
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<RefreshGrant, AuthError>;

    /// Informs the server that the session is over
    ///
    /// Best-effort: callers do not wait on or act upon the outcome.
    async fn logout(&self, access_token: &AccessTokenRef) -> Result<(), AuthError>;

    /// Asks the server whether the access token is still accepted
    async fn status(&self, access_token: &AccessTokenRef) -> Result<AuthStatus, AuthError>;

    /// Requests a password reset email
    async fn forgot_password(&self, email: &str) -> Result<(), AuthError>;

    /// Completes a password reset
    async fn reset_password(
        &self,
        token: &ResetTokenRef,
        new_password: &Password,
    ) -> Result<(), AuthError>;
}
