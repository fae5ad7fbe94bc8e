//! Bearer session lifecycle management
//!
//! This library keeps a client's authenticated session alive. It acquires a
//! session through an authorization server, persists it in client-side
//! storage, renews it before and after the access token expires, and tears it
//! down when renewal is no longer possible.
//!
//! Renewal is _single-flight_: however many requests discover at the same
//! moment that their token has been rejected, exactly one refresh call is made
//! on their behalf, and every one of them receives its outcome. A request that
//! receives a token this way is retried with it; a request that receives a
//! terminal failure is rejected, and the session is ended exactly once, with
//! the user sent to the login surface.
//!
//! # General Flow
//!
//! On start-up, construct an [`AuthContext`] from a configuration, a gateway
//! to the authorization server, a storage backend and a navigator. Any
//! persisted session is resumed, and an [`ExpiryMonitor`] is started which
//! renews the session once its access token turns _stale_, by default after
//! three quarters of its remaining lifetime.
//!
//! ```
//! use std::sync::Arc;
//! use tollgate::{gateway, navigator, storage, AuthConfig, AuthContext};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::new("https://auth.example.com/api/".parse()?);
//! let gateway = gateway::HttpAuthGateway::from_config(&config)?;
//!
//! let context = AuthContext::start(
//!     &config,
//!     Arc::new(gateway),
//!     storage::FileStorage::new("session.json"),
//!     Arc::new(navigator::NullNavigator),
//! )
//! .await;
//!
//! let status = context.session().check_status().await;
//! tracing::info!(authenticated = status.authenticated, "session resumed");
//! # Ok(())
//! # }
//! ```
//!
//! Outbound requests are guarded by handing the context's
//! [`RefreshCoordinator`] to a request pipeline, such as the middleware
//! provided by `tollgate_reqwest`.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `http`: Provides an implementation of [`AuthGateway`][gateway::AuthGateway] speaking JSON
//!   over HTTP using [reqwest].
//! * `file`: Provides an implementation of [`SessionStorage`][storage::SessionStorage] using the
//!   local filesystem.
//! * `rand`: Provides for an implementation of [JitterSource][jitter::JitterSource] based on the
//!   random number generator provided by the [rand] crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod auth;
pub mod backoff;
mod braids;
pub mod config;
mod context;
mod coordinator;
pub mod error;
pub mod gateway;
pub mod jitter;
mod lifetime;
mod monitor;
pub mod navigator;
mod session;
pub mod storage;
mod store;
mod teardown;

pub use auth::{AuthSession, SessionStatus};
pub use braids::*;
pub use config::AuthConfig;
pub use context::AuthContext;
pub use coordinator::RefreshCoordinator;
pub use error::{classify, AuthError, ConfigError, TerminalReason};
pub use lifetime::LifetimePolicy;
pub use monitor::ExpiryMonitor;
pub use session::{Role, Session, TokenStatus, UserRecord};
pub use store::SessionStore;
pub use teardown::SessionTeardown;
