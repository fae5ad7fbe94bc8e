//! Middleware to keep outgoing requests authorized by the current session
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`SessionMiddleware`] in the middleware stack to attach the
//! session's access token to each outbound request.
//!
//! If a request is rejected with `401 Unauthorized`, the middleware asks the
//! [`RefreshCoordinator`] for a fresh token and resubmits the request once
//! with it. Concurrent rejections share a single refresh. If the session
//! cannot be renewed, the request fails with a terminal
//! [`AuthError`][tollgate::AuthError], and the session is torn down.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required. Such requests
//! are never retried.
//!
//! Other non-success responses are classified into the same error taxonomy,
//! so callers only ever see an [`AuthError`][tollgate::AuthError]; use
//! [`auth_error()`] to get at it.
//!
//! ```
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tollgate::RefreshCoordinator;
//! use tollgate_reqwest::SessionMiddleware;
//!
//! fn client(coordinator: RefreshCoordinator) -> reqwest_middleware::ClientWithMiddleware {
//!     ClientBuilder::new(Client::default())
//!         .with(SessionMiddleware::new(coordinator))
//!         .build()
//! }
//! ```
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. These predicates can be composed together to
//! evaluate more complex requirements prior to attaching a token to a
//! request.
//!
//! ```
//! use predicates::prelude::PredicateBooleanExt;
//! use tollgate::RefreshCoordinator;
//! use tollgate_reqwest::{ExactHostMatch, HttpsOnly, SessionMiddleware};
//!
//! fn middleware(coordinator: RefreshCoordinator) -> impl reqwest_middleware::Middleware {
//!     SessionMiddleware::new(coordinator)
//!         .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.example.com")))
//! }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use tollgate::{
    gateway::SKIP_AUTH_REFRESH_HEADER, AccessToken, AccessTokenRef, AuthError,
    RefreshCoordinator, TerminalReason,
};

/// A middleware that authorizes outgoing requests with the current session
/// and renews the session when a request is rejected
#[derive(Clone, Debug)]
pub struct SessionMiddleware<P> {
    coordinator: RefreshCoordinator,
    predicate: P,
}

impl SessionMiddleware<HttpsOnly> {
    /// Construct a new middleware from a refresh coordinator
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> SessionMiddleware<P> {
        SessionMiddleware {
            coordinator: self.coordinator,
            predicate,
        }
    }
}

/// Marks a request that has already been resubmitted after a renewal
#[derive(Clone, Copy, Debug)]
struct AlreadyRetried;

impl<P> SessionMiddleware<P> {
    fn current_token(&self) -> Option<AccessToken> {
        let session = self.coordinator.store().current()?;

        if tracing::enabled!(tracing::Level::TRACE) {
            let now = self.coordinator.clock().now();

            tracing::trace!(
                token.status = ?session.token_status_at(now, None),
                token.expiry = session.expires_at().map(|t| t.0),
                token.until_expired = session.until_expired_at(now).map(|d| d.0),
                "obtained access token"
            );
        }

        Some(session.access_token().to_owned())
    }

    async fn terminate(&self, reason: TerminalReason) -> reqwest_middleware::Error {
        self.coordinator.teardown().terminate(reason).await;
        reqwest_middleware::Error::middleware(AuthError::terminal(reason))
    }
}

fn bearer(token: &AccessTokenRef) -> Option<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    match header::HeaderValue::from_maybe_shared(header_value.freeze()) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(_) => {
            tracing::warn!("access token is not a valid header value, not attaching it");
            None
        }
    }
}

fn normalize(error: reqwest_middleware::Error) -> reqwest_middleware::Error {
    match error {
        reqwest_middleware::Error::Reqwest(error) => {
            let error = AuthError::from_transport(&error);
            tracing::debug!(%error, "no response received");
            reqwest_middleware::Error::middleware(error)
        }
        other => other,
    }
}

async fn classify(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status.is_informational() || status.is_redirection() {
        return Ok(response);
    }

    let method_url = response.url().to_string();
    let body = response.bytes().await.map_err(|error| {
        reqwest_middleware::Error::middleware(AuthError::from_transport(&error))
    })?;

    let error = tracing::info_span!("response", url = %method_url)
        .in_scope(|| tollgate::classify(status.as_u16(), &body));

    match error {
        Some(error) => Err(reqwest_middleware::Error::middleware(error)),
        None => Err(reqwest_middleware::Error::middleware(AuthError::Server {
            status: status.as_u16(),
        })),
    }
}

#[async_trait::async_trait]
impl<P> Middleware for SessionMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let skip_refresh = req.headers().contains_key(SKIP_AUTH_REFRESH_HEADER);
        let already_retried = extensions.get::<AlreadyRetried>().is_some();

        let mut attached = None;
        if self.predicate.eval(&req) {
            if let header::Entry::Vacant(entry) = req.headers_mut().entry(header::AUTHORIZATION) {
                if let Some(token) = self.current_token() {
                    if let Some(value) = bearer(&token) {
                        entry.insert(value);
                        attached = Some(token);
                    }
                }
            }
        }

        let replay = match &attached {
            Some(_) if !skip_refresh && !already_retried => req.try_clone(),
            _ => None,
        };

        let response = next.clone().run(req, extensions).await.map_err(normalize)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return classify(response).await;
        }

        if skip_refresh || already_retried {
            tracing::info!(
                skip_refresh,
                already_retried,
                url = %response.url(),
                "request rejected after renewal, ending session"
            );
            return Err(self.terminate(TerminalReason::Expired).await);
        }

        let Some(rejected) = attached else {
            return classify(response).await;
        };

        let Some(mut replay) = replay else {
            tracing::debug!(url = %response.url(), "request body cannot be replayed, not retrying");
            return classify(response).await;
        };

        tracing::debug!(url = %response.url(), "access token rejected, renewing session");
        let token = self
            .coordinator
            .obtain_fresh_token_after(&rejected)
            .await
            .map_err(reqwest_middleware::Error::middleware)?;

        match bearer(&token) {
            Some(value) => {
                replay.headers_mut().insert(header::AUTHORIZATION, value);
            }
            None => return classify(response).await,
        }
        extensions.insert(AlreadyRetried);

        let response = next.run(replay, extensions).await.map_err(normalize)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::info!(
                url = %response.url(),
                "renewed access token rejected, ending session"
            );
            return Err(self.terminate(TerminalReason::Expired).await);
        }

        classify(response).await
    }
}

/// Extracts the session error from a failed request, if it carries one
pub fn auth_error(error: &reqwest_middleware::Error) -> Option<&AuthError> {
    match error {
        reqwest_middleware::Error::Middleware(error) => error.downcast_ref::<AuthError>(),
        reqwest_middleware::Error::Reqwest(_) => None,
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<value not valid utf-8>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let result = dbg!(HttpsOnly.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let result = dbg!(HttpsOnly.find_case(false, &request));
            assert!(result.is_none())
        }
    }

    mod exact_host_match_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_same_host() {
            let request =
                Request::new(reqwest::Method::GET, "https://api.example.com".parse().unwrap());
            let predicate = ExactHostMatch::new("api.example.com");
            assert!(predicate.find_case(true, &request).is_none())
        }

        #[test]
        fn reports_mismatched_host() {
            let request =
                Request::new(reqwest::Method::GET, "https://elsewhere.com".parse().unwrap());
            let predicate = ExactHostMatch::new("api.example.com");
            assert!(predicate.find_case(true, &request).is_some())
        }
    }

    #[test]
    fn bearer_value_is_sensitive() {
        let value = bearer(&AccessToken::from_static("abc")).unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer abc");
        assert!(value.is_sensitive());
    }

    #[test]
    fn token_with_newline_is_not_attached() {
        assert!(bearer(&AccessToken::from_static("abc\ndef")).is_none());
    }
}
