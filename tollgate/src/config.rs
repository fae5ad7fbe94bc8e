//! Static configuration for the session subsystem

use std::time::Duration;

use serde::Deserialize;
use tollgate_clock::DurationSecs;
use url::Url;

use crate::{backoff::ErrorBackoffConfig, error::ConfigError, LifetimePolicy};

/// Paths of the authorization server's operations, relative to the base URL
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// `POST` email/password login
    pub login: String,
    /// `POST` account creation
    pub signup: String,
    /// `POST` access token renewal
    pub refresh: String,
    /// `POST` best-effort server-side logout
    pub logout: String,
    /// `GET` session re-validation
    pub status: String,
    /// `POST` password reset request
    pub forgot_password: String,
    /// `POST` password reset completion
    pub reset_password: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "login".into(),
            signup: "signup".into(),
            refresh: "refresh-token".into(),
            logout: "logout".into(),
            status: "auth-status".into(),
            forgot_password: "forgot-password".into(),
            reset_password: "reset-password".into(),
        }
    }
}

/// Configuration of the session subsystem
///
/// Every field other than `base_url` has a default, so a minimal
/// configuration document only names the server.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the authorization server; endpoints are joined onto it
    pub base_url: Url,
    /// Endpoint paths
    #[serde(default)]
    pub endpoints: Endpoints,
    /// Fixed timeout applied to every call to the authorization server
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Ratio of the remaining lifetime after which a session is renewed proactively
    #[serde(default = "default_freshness_period")]
    pub freshness_period: f64,
    /// Minimum delay before a proactive renewal
    #[serde(default)]
    pub min_proactive_delay_secs: u64,
    /// Upper bound on how much earlier a proactive renewal may be jittered
    #[serde(default)]
    pub max_jitter_secs: u64,
    /// Backoff applied between failed proactive renewals
    #[serde(default)]
    pub backoff: ErrorBackoffConfig,
    /// Where the user is sent when the session ends
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Path prefixes that belong to the sign-in flow and are never recorded as
    /// a post-login redirect target
    #[serde(default = "default_auth_paths")]
    pub auth_paths: Vec<String>,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_freshness_period() -> f64 {
    0.75
}

fn default_login_path() -> String {
    "/login".into()
}

fn default_auth_paths() -> Vec<String> {
    ["/login", "/signup", "/forgot-password", "/reset-password"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl AuthConfig {
    /// A configuration using defaults for everything but the server location
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            endpoints: Endpoints::default(),
            request_timeout_secs: default_request_timeout_secs(),
            freshness_period: default_freshness_period(),
            min_proactive_delay_secs: 0,
            max_jitter_secs: 0,
            backoff: ErrorBackoffConfig::default(),
            login_path: default_login_path(),
            auth_paths: default_auth_paths(),
        }
    }

    /// The fixed request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The proactive renewal policy described by this configuration
    pub fn lifetime_policy(&self) -> LifetimePolicy {
        LifetimePolicy::new(
            self.freshness_period,
            DurationSecs(self.min_proactive_delay_secs),
        )
    }

    /// The redirect rules described by this configuration
    pub fn redirect_rules(&self) -> RedirectRules {
        RedirectRules {
            login_path: self.login_path.clone(),
            auth_paths: self.auth_paths.clone(),
        }
    }

    /// Resolves an endpoint path against the base URL
    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, ConfigError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        base.join(endpoint.trim_start_matches('/'))
            .map_err(|source| ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_owned(),
                source,
            })
    }
}

/// Where to send the user when their session ends, and which paths are part
/// of the sign-in flow itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectRules {
    login_path: String,
    auth_paths: Vec<String>,
}

impl Default for RedirectRules {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            auth_paths: default_auth_paths(),
        }
    }
}

impl RedirectRules {
    /// Whether `path` is part of the sign-in flow
    pub fn is_auth_path(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        self.auth_paths.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// The login surface location carrying a `session=<reason>` indicator
    pub fn login_location(&self, reason: crate::TerminalReason) -> String {
        let separator = if self.login_path.contains('?') { '&' } else { '?' };
        format!("{}{}session={}", self.login_path, separator, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TerminalReason;

    #[test]
    fn minimal_document_uses_defaults() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"base_url":"https://auth.example.com/api"}"#).unwrap();
        assert_eq!(config, AuthConfig::new("https://auth.example.com/api".parse().unwrap()));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.lifetime_policy(), LifetimePolicy::default());
    }

    #[test]
    fn endpoints_join_below_base_path() {
        let config = AuthConfig::new("https://auth.example.com/api".parse().unwrap());
        assert_eq!(
            config.endpoint_url(&config.endpoints.refresh).unwrap().as_str(),
            "https://auth.example.com/api/refresh-token"
        );
        assert_eq!(
            config.endpoint_url("/auth-status").unwrap().as_str(),
            "https://auth.example.com/api/auth-status"
        );
    }

    #[test]
    fn auth_paths_match_whole_segments() {
        let rules = RedirectRules::default();
        assert!(rules.is_auth_path("/login"));
        assert!(rules.is_auth_path("/login?session=expired"));
        assert!(rules.is_auth_path("/reset-password/abc"));
        assert!(!rules.is_auth_path("/loginhelp"));
        assert!(!rules.is_auth_path("/dashboard"));
    }

    #[test]
    fn login_location_carries_reason() {
        let rules = RedirectRules::default();
        assert_eq!(
            rules.login_location(TerminalReason::Expired),
            "/login?session=expired"
        );
    }
}
