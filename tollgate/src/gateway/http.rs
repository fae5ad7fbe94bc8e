//! An [`AuthGateway`] speaking JSON over HTTP

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Url};

use super::{
    dto, AuthGateway, AuthGrant, AuthStatus, Credentials, RefreshGrant, Registration,
    SKIP_AUTH_REFRESH_HEADER,
};
use crate::{
    error::ConfigError, AccessTokenRef, AuthConfig, AuthError, Password, RefreshTokenRef,
    ResetTokenRef,
};

#[derive(Clone, Debug)]
struct EndpointUrls {
    login: Url,
    signup: Url,
    refresh: Url,
    logout: Url,
    status: Url,
    forgot_password: Url,
    reset_password: Url,
}

impl EndpointUrls {
    fn resolve(config: &AuthConfig) -> Result<Self, ConfigError> {
        let endpoints = &config.endpoints;
        Ok(Self {
            login: config.endpoint_url(&endpoints.login)?,
            signup: config.endpoint_url(&endpoints.signup)?,
            refresh: config.endpoint_url(&endpoints.refresh)?,
            logout: config.endpoint_url(&endpoints.logout)?,
            status: config.endpoint_url(&endpoints.status)?,
            forgot_password: config.endpoint_url(&endpoints.forgot_password)?,
            reset_password: config.endpoint_url(&endpoints.reset_password)?,
        })
    }
}

/// A gateway to an authorization server over HTTP
///
/// Every call carries the configured timeout. The refresh call is marked with
/// the [`SKIP_AUTH_REFRESH_HEADER`] so that a refresh-aware middleware stack
/// never tries to renew the session in order to renew the session.
#[derive(Clone, Debug)]
pub struct HttpAuthGateway {
    client: reqwest::Client,
    urls: EndpointUrls,
    timeout: Duration,
}

impl HttpAuthGateway {
    /// Constructs a gateway with its own HTTP client
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(ConfigError::HttpClient)?;

        Self::with_client(client, config)
    }

    /// Constructs a gateway around an existing HTTP client
    pub fn with_client(client: reqwest::Client, config: &AuthConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            urls: EndpointUrls::resolve(config)?,
            timeout: config.request_timeout(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(u16, bytes::Bytes), AuthError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status().as_u16();
        tracing::debug!(response.status = status, "received response from authorization server");

        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        Ok((status, body))
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    #[tracing::instrument(
        err,
        skip(self, credentials),
        fields(url = %self.urls.login, role = credentials.role.as_str()),
    )]
    async fn login(&self, credentials: &Credentials) -> Result<AuthGrant, AuthError> {
        let body = dto::LoginBody {
            email: &credentials.email,
            password: &credentials.password,
            role: credentials.role,
        };
        let (status, body) = self.send(self.client.post(self.urls.login.clone()).json(&body)).await?;
        dto::auth_grant(status, &body)
    }

    #[tracing::instrument(
        err,
        skip(self, registration),
        fields(url = %self.urls.signup, role = registration.role.as_str()),
    )]
    async fn signup(&self, registration: &Registration) -> Result<AuthGrant, AuthError> {
        let body = dto::SignupBody {
            email: &registration.email,
            password: &registration.password,
            role: registration.role,
            profile: registration.profile.as_ref(),
        };
        let (status, body) = self.send(self.client.post(self.urls.signup.clone()).json(&body)).await?;
        dto::auth_grant(status, &body)
    }

    #[tracing::instrument(err, skip(self, refresh_token), fields(url = %self.urls.refresh))]
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<RefreshGrant, AuthError> {
        let body = dto::RefreshBody { refresh_token };
        let request = self
            .client
            .post(self.urls.refresh.clone())
            .header(SKIP_AUTH_REFRESH_HEADER, "true")
            .json(&body);
        let (status, body) = self.send(request).await?;
        dto::refresh_grant(status, &body)
    }

    #[tracing::instrument(err, skip(self, access_token), fields(url = %self.urls.logout))]
    async fn logout(&self, access_token: &AccessTokenRef) -> Result<(), AuthError> {
        let request = authorized(self.client.post(self.urls.logout.clone()), access_token)
            .header(SKIP_AUTH_REFRESH_HEADER, "true");
        let (status, body) = self.send(request).await?;
        dto::acknowledged(status, &body)
    }

    #[tracing::instrument(err, skip(self, access_token), fields(url = %self.urls.status))]
    async fn status(&self, access_token: &AccessTokenRef) -> Result<AuthStatus, AuthError> {
        let request = authorized(self.client.get(self.urls.status.clone()), access_token);
        let (status, body) = self.send(request).await?;
        dto::auth_status(status, &body)
    }

    #[tracing::instrument(err, skip(self, email), fields(url = %self.urls.forgot_password))]
    async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        let body = dto::ForgotPasswordBody { email };
        let (status, body) = self
            .send(self.client.post(self.urls.forgot_password.clone()).json(&body))
            .await?;
        dto::acknowledged(status, &body)
    }

    #[tracing::instrument(err, skip_all, fields(url = %self.urls.reset_password))]
    async fn reset_password(
        &self,
        token: &ResetTokenRef,
        new_password: &Password,
    ) -> Result<(), AuthError> {
        let body = dto::ResetPasswordBody {
            token,
            new_password,
        };
        let (status, body) = self
            .send(self.client.post(self.urls.reset_password.clone()).json(&body))
            .await?;
        dto::acknowledged(status, &body)
    }
}

fn bearer(token: &AccessTokenRef) -> Option<header::HeaderValue> {
    let mut value = header::HeaderValue::try_from(format!("Bearer {}", token.as_str())).ok()?;
    value.set_sensitive(true);
    Some(value)
}

fn authorized(
    request: reqwest::RequestBuilder,
    token: &AccessTokenRef,
) -> reqwest::RequestBuilder {
    match bearer(token) {
        Some(value) => request.header(header::AUTHORIZATION, value),
        None => {
            tracing::warn!("access token is not a valid header value, sending without it");
            request
        }
    }
}
