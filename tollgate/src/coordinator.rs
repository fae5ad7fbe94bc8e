//! Single-flight session renewal
//!
//! At most one refresh call is in flight at any time. Callers arriving while
//! a refresh is running queue up behind it and receive its outcome; they
//! never touch the network themselves.
//!
//! The refresh itself runs on its own task, so it completes even if every
//! caller that asked for it has gone away. That task owns a guard which, if
//! dropped before the outcome is delivered, rejects every queued caller and
//! returns the coordinator to idle. Each caller holds the receiving half of a
//! oneshot channel, so no caller can be answered twice.

use std::{
    collections::VecDeque,
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;
use tollgate_clock::{Clock, System};
use tracing::Instrument;

use crate::{
    gateway::AuthGateway, AccessToken, AccessTokenRef, AuthError, SessionStore, SessionTeardown,
    TerminalReason,
};

type Outcome = Result<AccessToken, AuthError>;

enum RefreshState {
    Idle,
    Refreshing { waiters: VecDeque<Waiter> },
}

/// A caller queued behind the in-flight refresh
struct Waiter {
    /// Arrival position within the flight, starting at 1
    ticket: usize,
    tx: oneshot::Sender<Outcome>,
}

/// Coordinates renewal of the session's access token
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    gateway: Arc<dyn AuthGateway>,
    store: SessionStore,
    teardown: SessionTeardown,
    clock: Arc<dyn Clock + Send + Sync>,
    state: Mutex<RefreshState>,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("store", &self.inner.store)
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    /// Constructs a coordinator using the system clock
    pub fn new(
        gateway: Arc<dyn AuthGateway>,
        store: SessionStore,
        teardown: SessionTeardown,
    ) -> Self {
        Self::with_clock(gateway, store, teardown, Arc::new(System))
    }

    /// Constructs a coordinator using the given clock to compute expiries
    pub fn with_clock(
        gateway: Arc<dyn AuthGateway>,
        store: SessionStore,
        teardown: SessionTeardown,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                gateway,
                store,
                teardown,
                clock,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    /// The store this coordinator renews
    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// The teardown invoked on terminal failures
    pub fn teardown(&self) -> &SessionTeardown {
        &self.inner.teardown
    }

    /// The clock renewed expiries are computed against
    pub fn clock(&self) -> &(dyn Clock + Send + Sync) {
        &*self.inner.clock
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), RefreshState::Refreshing { .. })
    }

    /// Obtains a freshly renewed access token
    ///
    /// Starts a refresh if none is in flight, otherwise waits for the one
    /// that is.
    pub async fn obtain_fresh_token(&self) -> Result<AccessToken, AuthError> {
        self.obtain(None).await
    }

    /// Obtains an access token to replace `rejected`
    ///
    /// If the session already carries a different token, because a refresh
    /// completed after `rejected` was sent, that token is returned without
    /// any network call.
    pub async fn obtain_fresh_token_after(
        &self,
        rejected: &AccessTokenRef,
    ) -> Result<AccessToken, AuthError> {
        self.obtain(Some(rejected)).await
    }

    async fn obtain(&self, rejected: Option<&AccessTokenRef>) -> Outcome {
        let pending = {
            let mut state = self.inner.lock_state();

            if let (Some(rejected), Some(current)) = (rejected, self.inner.store.current()) {
                if current.access_token() != rejected {
                    tracing::debug!("session already renewed, reusing current token");
                    return Ok(current.access_token().to_owned());
                }
            }

            let (tx, rx) = oneshot::channel();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    let ticket = waiters.len() + 1;
                    waiters.push_back(Waiter { ticket, tx });
                    tracing::trace!(ticket, "joined in-flight refresh");
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing {
                        waiters: VecDeque::new(),
                    };
                    tracing::debug!("starting refresh");
                    let flight = Flight {
                        inner: self.inner.clone(),
                        leader: Some(tx),
                    };
                    tokio::spawn(flight.run().in_current_span());
                }
            }
            rx
        };

        pending.await.unwrap_or(Err(AuthError::RefreshAbandoned))
    }
}

impl CoordinatorInner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh(&self) -> Outcome {
        let Some(session) = self.store.current() else {
            tracing::debug!("no session to renew");
            return Err(AuthError::terminal(TerminalReason::Expired));
        };

        let Some(refresh_token) = session.refresh_token().map(ToOwned::to_owned) else {
            tracing::info!("session carries no refresh token, it cannot be renewed");
            self.teardown.terminate(TerminalReason::Expired).await;
            return Err(AuthError::terminal(TerminalReason::Expired));
        };

        match self.gateway.refresh(&refresh_token).await {
            Ok(grant) => {
                let renewed = session.renewed(grant, self.clock.now());
                let token = renewed.access_token().to_owned();
                let expires_at = renewed.expires_at().map(|t| t.0);

                if self.store.renew(&refresh_token, renewed).await {
                    tracing::info!(expires_at, "session renewed");
                    Ok(token)
                } else {
                    Err(AuthError::terminal(TerminalReason::Expired))
                }
            }
            Err(error) => {
                if let Some(reason) = error.terminal_reason() {
                    tracing::warn!(%reason, "session renewal refused");
                    self.teardown.terminate(reason).await;
                } else {
                    tracing::warn!(
                        error = (&error as &dyn std::error::Error),
                        "session renewal failed, keeping session"
                    );
                }
                Err(error)
            }
        }
    }
}

/// The single in-flight refresh
///
/// Delivers the outcome to every queued waiter in arrival order, then to the
/// caller that started it.
struct Flight {
    inner: Arc<CoordinatorInner>,
    leader: Option<oneshot::Sender<Outcome>>,
}

impl Flight {
    async fn run(mut self) {
        let outcome = self.inner.refresh().await;
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: Outcome) {
        let waiters = match mem::replace(&mut *self.inner.lock_state(), RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => VecDeque::new(),
        };

        tracing::trace!(waiters = waiters.len(), ok = outcome.is_ok(), "refresh settled");

        for waiter in waiters {
            tracing::trace!(ticket = waiter.ticket, "answering waiter");
            let _ = waiter.tx.send(outcome.clone());
        }

        if let Some(leader) = self.leader.take() {
            tracing::trace!("answering leader");
            let _ = leader.send(outcome);
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if self.leader.is_some() {
            tracing::warn!("refresh torn down before settling");
            self.settle(Err(AuthError::RefreshAbandoned));
        }
    }
}
