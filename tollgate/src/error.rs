//! The error taxonomy surfaced to consumers of the session
//!
//! Every failure is normalized into an [`AuthError`] whose `Display` is a
//! human-readable message fit for showing to a user. Raw transport errors are
//! folded into [`AuthError::Network`] at the boundary.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Why a session was torn down
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminalReason {
    /// The refresh credential was rejected or is missing
    Expired,
    /// The authorization server answered with something unusable
    Error,
}

impl TerminalReason {
    /// The reason code appended to the login surface on redirect
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalReason::Expired => "expired",
            TerminalReason::Error => "error",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error arising from the session subsystem or the requests it guards
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No response was received (offline, timeout, DNS or connection failure)
    #[error("unable to reach the server, check your connection and try again")]
    Network {
        /// Transport detail, for diagnostics only
        detail: String,
        /// Whether the request timed out
        timed_out: bool,
    },
    /// The server rejected the supplied credentials outside of a session renewal
    #[error("{message}")]
    Unauthorized {
        /// Server-supplied or fallback message
        message: String,
    },
    /// The session can no longer be recovered locally and must be re-established
    #[error("your session has expired, please sign in again")]
    Terminal {
        /// Why the session ended
        reason: TerminalReason,
    },
    /// The request was rejected as invalid (4xx other than 401)
    #[error("{message}")]
    Validation {
        /// The HTTP status received
        status: u16,
        /// Server-supplied or fallback message
        message: String,
    },
    /// The server failed to handle the request (5xx)
    #[error("something went wrong on our side, please try again later")]
    Server {
        /// The HTTP status received
        status: u16,
    },
    /// The in-flight renewal was torn down before it settled
    #[error("session renewal was interrupted, please try again")]
    RefreshAbandoned,
}

const VALIDATION_FALLBACK: &str = "the request could not be processed";
const UNAUTHORIZED_FALLBACK: &str = "the supplied credentials were not accepted";

impl AuthError {
    /// A terminal error with the given reason
    #[inline]
    pub const fn terminal(reason: TerminalReason) -> Self {
        AuthError::Terminal { reason }
    }

    /// Whether recovery requires signing in again
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::Terminal { .. })
    }

    /// Whether repeating the same operation later may succeed
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthError::Network { .. } | AuthError::Server { .. } | AuthError::RefreshAbandoned
        )
    }

    /// The terminal reason, if this error ended the session
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        match self {
            AuthError::Terminal { reason } => Some(*reason),
            _ => None,
        }
    }

    /// Normalizes a transport failure, where no response was received
    #[cfg(feature = "http")]
    pub fn from_transport(error: &reqwest::Error) -> Self {
        AuthError::Network {
            detail: error.to_string(),
            timed_out: error.is_timeout(),
        }
    }
}

/// The shape of error bodies returned by the server
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Extracts a server-supplied message from an error body, if there is one
pub fn server_message(body: &[u8]) -> Option<String> {
    let body: ErrorBody = serde_json::from_slice(body).ok()?;
    body.message
        .or(body.error)
        .map(|m| m.trim().to_owned())
        .filter(|m| !m.is_empty())
}

/// Classifies a non-success response into the error taxonomy
///
/// Returns `None` for statuses below 400. A 401 classifies as
/// [`AuthError::Unauthorized`]; callers that own session renewal intercept
/// 401s before reaching this point.
pub fn classify(status: u16, body: &[u8]) -> Option<AuthError> {
    match status {
        0..=399 => None,
        401 => Some(AuthError::Unauthorized {
            message: server_message(body).unwrap_or_else(|| UNAUTHORIZED_FALLBACK.to_owned()),
        }),
        400..=499 => Some(AuthError::Validation {
            status,
            message: server_message(body).unwrap_or_else(|| VALIDATION_FALLBACK.to_owned()),
        }),
        _ => {
            tracing::error!(
                response.status = status,
                response.body = %String::from_utf8_lossy(body),
                "server error"
            );
            Some(AuthError::Server { status })
        }
    }
}

/// An error in the static configuration of the subsystem
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An endpoint could not be joined onto the base URL
    #[error("invalid endpoint `{endpoint}`")]
    InvalidEndpoint {
        /// The offending endpoint path
        endpoint: String,
        /// The underlying parse failure
        #[source]
        source: url::ParseError,
    },
    /// The HTTP client could not be constructed
    #[cfg(feature = "http")]
    #[error("unable to construct HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_prefer_server_message() {
        let err = classify(422, br#"{"message":"email already registered"}"#).unwrap();
        assert_eq!(
            err,
            AuthError::Validation {
                status: 422,
                message: "email already registered".into()
            }
        );
        assert_eq!(err.to_string(), "email already registered");
    }

    #[test]
    fn validation_errors_fall_back_to_generic_message() {
        let err = classify(400, b"<html>bad</html>").unwrap();
        assert_eq!(err.to_string(), VALIDATION_FALLBACK);

        let err = classify(404, br#"{"error":"  "}"#).unwrap();
        assert_eq!(err.to_string(), VALIDATION_FALLBACK);
    }

    #[test]
    fn error_field_is_used_when_message_absent() {
        let err = classify(403, br#"{"error":"forbidden for parents"}"#).unwrap();
        assert_eq!(err.to_string(), "forbidden for parents");
    }

    #[test]
    fn server_errors_are_generic_and_transient() {
        let err = classify(503, br#"{"message":"db exploded"}"#).unwrap();
        assert_eq!(err, AuthError::Server { status: 503 });
        assert!(err.is_transient());
        assert!(!err.to_string().contains("db exploded"));
    }

    #[test]
    fn success_statuses_do_not_classify() {
        assert_eq!(classify(200, b""), None);
        assert_eq!(classify(302, b""), None);
    }

    #[test]
    fn terminal_reasons_render_as_codes() {
        assert_eq!(TerminalReason::Expired.to_string(), "expired");
        assert_eq!(
            AuthError::terminal(TerminalReason::Error).terminal_reason(),
            Some(TerminalReason::Error)
        );
        assert!(!AuthError::RefreshAbandoned.is_terminal());
    }
}
