//! Wiring for a complete session subsystem

use std::sync::Arc;

use tollgate_clock::{Clock, DurationSecs, System};

use crate::{
    gateway::AuthGateway,
    jitter::{JitterSource, NullJitter},
    navigator::Navigator,
    storage::SessionStorage,
    AuthConfig, AuthSession, ExpiryMonitor, RefreshCoordinator, SessionStore, SessionTeardown,
};

/// A running session subsystem
///
/// Holds the store, the refresh coordinator shared by every request pipeline,
/// the consumer-facing session and the proactive renewal monitor. Dropping
/// the context stops proactive renewal.
#[derive(Debug)]
pub struct AuthContext {
    store: SessionStore,
    coordinator: RefreshCoordinator,
    session: AuthSession,
    monitor: ExpiryMonitor,
}

impl AuthContext {
    /// Resumes any persisted session and starts monitoring it, using the
    /// system clock
    pub async fn start<S>(
        config: &AuthConfig,
        gateway: Arc<dyn AuthGateway>,
        storage: S,
        navigator: Arc<dyn Navigator>,
    ) -> Self
    where
        S: SessionStorage + 'static,
    {
        Self::start_with_clock(config, gateway, storage, navigator, Arc::new(System)).await
    }

    /// Resumes any persisted session and starts monitoring it against `clock`
    pub async fn start_with_clock<S>(
        config: &AuthConfig,
        gateway: Arc<dyn AuthGateway>,
        storage: S,
        navigator: Arc<dyn Navigator>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self
    where
        S: SessionStorage + 'static,
    {
        let store = SessionStore::open(storage).await;
        let teardown = SessionTeardown::new(store.clone(), navigator, config.redirect_rules());
        let coordinator =
            RefreshCoordinator::with_clock(gateway.clone(), store.clone(), teardown, clock.clone());
        let session = AuthSession::with_clock(gateway, store.clone(), clock.clone())
            .with_renewal(coordinator.clone());
        let monitor = ExpiryMonitor::spawn_with(
            coordinator.clone(),
            config.lifetime_policy(),
            config.backoff,
            jitter_for(DurationSecs(config.max_jitter_secs)),
            clock,
        );

        Self {
            store,
            coordinator,
            session,
            monitor,
        }
    }

    /// The session store
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The refresh coordinator to hand to request pipelines
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// The consumer-facing session
    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    /// The proactive renewal monitor
    pub fn monitor(&self) -> &ExpiryMonitor {
        &self.monitor
    }
}

#[cfg(feature = "rand")]
fn jitter_for(max_jitter: DurationSecs) -> Box<dyn JitterSource + Send> {
    if max_jitter.0 == 0 {
        Box::new(NullJitter)
    } else {
        Box::new(crate::jitter::RandomEarlyJitter::new(max_jitter))
    }
}

#[cfg(not(feature = "rand"))]
fn jitter_for(max_jitter: DurationSecs) -> Box<dyn JitterSource + Send> {
    if max_jitter.0 != 0 {
        tracing::warn!(
            max_jitter = max_jitter.0,
            "jitter requested but the `rand` feature is disabled"
        );
    }
    Box::new(NullJitter)
}
