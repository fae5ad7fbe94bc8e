//! Wire formats for the authorization server and their interpretation

use serde::{Deserialize, Serialize};
use tollgate_clock::DurationSecs;

use super::{AuthGrant, AuthStatus, RefreshGrant};
use crate::{
    error::classify, AccessToken, AuthError, Password, RefreshTokenRef, RefreshToken,
    ResetTokenRef, Role, TerminalReason, UserRecord,
};

#[derive(Debug, Serialize)]
pub(crate) struct LoginBody<'a> {
    pub email: &'a str,
    pub password: &'a Password,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub(crate) struct SignupBody<'a> {
    pub email: &'a str,
    pub password: &'a Password,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<&'a serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshBody<'a> {
    pub refresh_token: &'a RefreshTokenRef,
}

#[derive(Debug, Serialize)]
pub(crate) struct ForgotPasswordBody<'a> {
    pub email: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResetPasswordBody<'a> {
    pub token: &'a ResetTokenRef,
    pub new_password: &'a Password,
}

/// A token-bearing response from login, signup or refresh
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default, alias = "accessToken")]
    token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<DurationSecs>,
    #[serde(default)]
    user: Option<UserRecord>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    user: Option<UserRecord>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn token_response(body: &[u8]) -> Result<(AccessToken, TokenResponse), AuthError> {
    let mut response: TokenResponse = serde_json::from_slice(body).map_err(|error| {
        tracing::warn!(%error, "unreadable token response");
        AuthError::terminal(TerminalReason::Error)
    })?;

    let Some(token) = non_empty(response.token.take()) else {
        tracing::warn!("token response did not carry an access token");
        return Err(AuthError::terminal(TerminalReason::Error));
    };

    Ok((AccessToken::new(token), response))
}

/// Interprets a login or signup response
pub(crate) fn auth_grant(status: u16, body: &[u8]) -> Result<AuthGrant, AuthError> {
    if let Some(error) = classify(status, body) {
        return Err(error);
    }

    let (token, response) = token_response(body)?;
    let Some(user) = response.user else {
        tracing::warn!("token response did not carry a user record");
        return Err(AuthError::terminal(TerminalReason::Error));
    };

    Ok(AuthGrant {
        token,
        refresh_token: non_empty(response.refresh_token).map(RefreshToken::new),
        expires_in: response.expires_in,
        user,
    })
}

/// Interprets a refresh response
///
/// Any 4xx means the refresh credential was refused and the session cannot
/// be renewed.
pub(crate) fn refresh_grant(status: u16, body: &[u8]) -> Result<RefreshGrant, AuthError> {
    if (400..500).contains(&status) {
        tracing::info!(response.status = status, "refresh token refused");
        return Err(AuthError::terminal(TerminalReason::Expired));
    }

    if let Some(error) = classify(status, body) {
        return Err(error);
    }

    let (token, response) = token_response(body)?;

    Ok(RefreshGrant {
        token,
        refresh_token: non_empty(response.refresh_token).map(RefreshToken::new),
        expires_in: response.expires_in,
    })
}

/// Interprets a session status response
pub(crate) fn auth_status(status: u16, body: &[u8]) -> Result<AuthStatus, AuthError> {
    if let Some(error) = classify(status, body) {
        return Err(error);
    }

    let response: StatusResponse = serde_json::from_slice(body).map_err(|error| {
        tracing::warn!(%error, "unreadable status response");
        AuthError::Server { status }
    })?;

    Ok(AuthStatus {
        user: response.user,
    })
}

/// Interprets a response that carries no payload of interest
pub(crate) fn acknowledged(status: u16, body: &[u8]) -> Result<(), AuthError> {
    match classify(status, body) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = r#"{"id":"u1","email":"ada@example.com","role":"teacher"}"#;

    #[test]
    fn login_grant_reads_camel_case_fields() {
        let body = format!(
            r#"{{"token":"a1","refreshToken":"r1","expiresIn":3600,"user":{}}}"#,
            USER
        );
        let grant = auth_grant(200, body.as_bytes()).unwrap();
        assert_eq!(grant.token.as_str(), "a1");
        assert_eq!(grant.refresh_token.as_deref().map(|r| r.as_str()), Some("r1"));
        assert_eq!(grant.expires_in, Some(DurationSecs(3600)));
        assert_eq!(grant.user.role, Role::Teacher);
    }

    #[test]
    fn login_grant_accepts_numeric_user_id() {
        let body = br#"{"token":"a1","user":{"id":42,"email":"ada@example.com"}}"#;
        let grant = auth_grant(200, body).unwrap();
        assert_eq!(grant.user.id, "42");
    }

    #[test]
    fn login_grant_without_token_is_terminal() {
        let body = format!(r#"{{"user":{}}}"#, USER);
        assert_eq!(
            auth_grant(200, body.as_bytes()).unwrap_err(),
            AuthError::terminal(TerminalReason::Error)
        );

        let body = format!(r#"{{"token":"  ","user":{}}}"#, USER);
        assert_eq!(
            auth_grant(201, body.as_bytes()).unwrap_err(),
            AuthError::terminal(TerminalReason::Error)
        );
    }

    #[test]
    fn rejected_login_is_unauthorized_not_terminal() {
        let err = auth_grant(401, br#"{"message":"wrong password"}"#).unwrap_err();
        assert_eq!(
            err,
            AuthError::Unauthorized {
                message: "wrong password".into()
            }
        );
        assert!(!err.is_terminal());
    }

    #[test]
    fn refused_refresh_is_terminal_expired() {
        for status in [400, 401, 403] {
            assert_eq!(
                refresh_grant(status, b"").unwrap_err(),
                AuthError::terminal(TerminalReason::Expired)
            );
        }
    }

    #[test]
    fn refresh_server_failure_is_transient() {
        let err = refresh_grant(502, b"bad gateway").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn refresh_without_token_is_terminal_error() {
        assert_eq!(
            refresh_grant(200, br#"{"expiresIn":60}"#).unwrap_err(),
            AuthError::terminal(TerminalReason::Error)
        );
    }

    #[test]
    fn refresh_accepts_access_token_alias() {
        let grant = refresh_grant(200, br#"{"accessToken":"a2"}"#).unwrap();
        assert_eq!(grant.token.as_str(), "a2");
        assert!(grant.refresh_token.is_none());
        assert!(grant.expires_in.is_none());
    }

    #[test]
    fn status_without_user_is_unauthenticated() {
        assert_eq!(auth_status(200, b"{}").unwrap(), AuthStatus { user: None });
        assert!(auth_status(200, USER.as_bytes()).unwrap().user.is_none());
    }

    #[test]
    fn request_bodies_use_wire_names() {
        let body = ResetPasswordBody {
            token: ResetTokenRef::from_str("t"),
            new_password: &Password::from_static("p"),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"token":"t","newPassword":"p"}"#
        );

        let body = RefreshBody {
            refresh_token: RefreshTokenRef::from_str("r"),
        };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"refreshToken":"r"}"#);
    }
}
