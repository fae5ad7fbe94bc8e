//! Proactive renewal ahead of token expiry
//!
//! The monitor follows the session store. Whenever a session with a known
//! expiry and a refresh token becomes current, a single timer is armed for the
//! moment the access token turns stale. Arming a new timer always cancels the
//! previous one, and ending the session cancels it outright.

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::AbortHandle;
use tollgate_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    jitter::{JitterSource, NullJitter},
    AccessToken, LifetimePolicy, RefreshCoordinator, Session,
};

/// Renews the session shortly before its access token expires
pub struct ExpiryMonitor {
    inner: Arc<MonitorInner>,
    supervisor: AbortHandle,
}

struct MonitorInner {
    coordinator: RefreshCoordinator,
    policy: LifetimePolicy,
    backoff: ErrorBackoffConfig,
    jitter: Mutex<Box<dyn JitterSource + Send>>,
    clock: Arc<dyn Clock + Send + Sync>,
    scheduled: Mutex<Option<ScheduledRefresh>>,
}

struct ScheduledRefresh {
    at: UnixTime,
    token: AccessToken,
    handle: AbortHandle,
}

impl fmt::Debug for ExpiryMonitor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ExpiryMonitor")
            .field("policy", &self.inner.policy)
            .field("scheduled_at", &self.scheduled_at())
            .finish_non_exhaustive()
    }
}

impl ExpiryMonitor {
    /// Starts monitoring the coordinator's session store using the system
    /// clock and no jitter
    pub fn spawn(
        coordinator: RefreshCoordinator,
        policy: LifetimePolicy,
        backoff: ErrorBackoffConfig,
    ) -> Self {
        Self::spawn_with(coordinator, policy, backoff, NullJitter, Arc::new(System))
    }

    /// Starts monitoring with a custom jitter source and clock
    pub fn spawn_with<J>(
        coordinator: RefreshCoordinator,
        policy: LifetimePolicy,
        backoff: ErrorBackoffConfig,
        jitter: J,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self
    where
        J: JitterSource + Send + 'static,
    {
        let inner = Arc::new(MonitorInner {
            coordinator,
            policy,
            backoff,
            jitter: Mutex::new(Box::new(jitter)),
            clock,
            scheduled: Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(inner.clone())).abort_handle();

        Self { inner, supervisor }
    }

    /// Arms the renewal timer for `session`, replacing any armed timer
    ///
    /// Returns the time the renewal will fire, or `None` if the session
    /// cannot be renewed proactively because it has no expiry or no refresh
    /// token.
    pub fn schedule(&self, session: &Session) -> Option<UnixTime> {
        self.inner.schedule(session)
    }

    /// Disarms the renewal timer
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// The time the armed renewal will fire, if one is armed
    pub fn scheduled_at(&self) -> Option<UnixTime> {
        self.inner.lock_scheduled().as_ref().map(|s| s.at)
    }
}

impl Drop for ExpiryMonitor {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.inner.cancel();
    }
}

impl MonitorInner {
    fn lock_scheduled(&self) -> MutexGuard<'_, Option<ScheduledRefresh>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, session: &Session) -> Option<UnixTime> {
        let mut scheduled = self.lock_scheduled();
        if let Some(previous) = scheduled.take() {
            previous.handle.abort();
        }

        let expires_at = match session.expires_at() {
            Some(expires_at) if session.is_proactively_renewable() => expires_at,
            _ => {
                tracing::debug!("session cannot be renewed proactively, not scheduling");
                return None;
            }
        };

        let now = self.clock.now();
        let stale_at = self.policy.stale_at(now, expires_at);
        let at = self
            .jitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jitter(stale_at)
            .max(now);

        tracing::debug!(
            at = at.0,
            expires_at = expires_at.0,
            delay = (at - now).0,
            "scheduling proactive renewal"
        );

        let token = session.access_token().to_owned();
        let handle = tokio::spawn(renew_when_stale(
            self.coordinator.clone(),
            self.clock.clone(),
            self.backoff,
            token.clone(),
            at,
            expires_at,
        ))
        .abort_handle();

        *scheduled = Some(ScheduledRefresh { at, token, handle });

        Some(at)
    }

    fn cancel(&self) {
        if let Some(previous) = self.lock_scheduled().take() {
            tracing::debug!(at = previous.at.0, "cancelling proactive renewal");
            previous.handle.abort();
        }
    }

    fn is_scheduled_for(&self, token: &AccessToken) -> bool {
        self.lock_scheduled()
            .as_ref()
            .is_some_and(|s| &s.token == token)
    }
}

async fn supervise(inner: Arc<MonitorInner>) {
    let mut sessions = inner.coordinator.store().subscribe();
    let mut last_seen: Option<AccessToken> = None;

    loop {
        let current = sessions.borrow_and_update().clone();
        match current {
            Some(session) => {
                let token = session.access_token().to_owned();
                if last_seen.as_ref() != Some(&token) && !inner.is_scheduled_for(&token) {
                    inner.schedule(&session);
                }
                last_seen = Some(token);
            }
            None => {
                last_seen = None;
                inner.cancel();
            }
        }

        if sessions.changed().await.is_err() {
            tracing::debug!("session store closed, halting renewal monitor");
            inner.cancel();
            return;
        }
    }
}

async fn renew_when_stale(
    coordinator: RefreshCoordinator,
    clock: Arc<dyn Clock + Send + Sync>,
    backoff: ErrorBackoffConfig,
    token: AccessToken,
    at: UnixTime,
    expires_at: UnixTime,
) {
    let mut backoff_handler = ErrorBackoffHandler::new(backoff);
    let mut delay = None;

    loop {
        match delay.take() {
            Some(d) => tokio::time::sleep(d).await,
            None => sleep_until(&*clock, at).await,
        }

        let Some(session) = coordinator.store().current() else {
            tracing::debug!("session ended before renewal");
            return;
        };
        if session.refresh_token().is_none() {
            tracing::debug!("session lost its refresh token, not renewing");
            return;
        }

        tracing::debug!("access token stale, renewing");
        match coordinator
            .obtain_fresh_token_after(&token)
            .await
            .with_backoff(&mut backoff_handler)
        {
            Ok(_) => return,
            Err((error, _)) if !error.is_transient() => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "proactive renewal failed, not retrying"
                );
                return;
            }
            Err((error, retry_in)) => {
                let retry_at = clock.now() + DurationSecs::from(retry_in);
                if retry_at >= expires_at {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "proactive renewal failed, token expires before next attempt"
                    );
                    return;
                }

                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    delay_ms = retry_in.as_millis() as u64,
                    "proactive renewal failed, will retry"
                );
                delay = Some(retry_in);
            }
        }
    }
}

/// Sleeps until the clock reads `t`
///
/// Timers do not advance while the host is suspended, so the clock is polled
/// on a heartbeat rather than trusting one long sleep.
async fn sleep_until(clock: &(dyn Clock + Send + Sync), t: UnixTime) {
    const HEARTBEAT: DurationSecs = DurationSecs(30);
    loop {
        let now = clock.now();
        if now >= t {
            tracing::trace!("token now stale");
            return;
        }

        let until_stale = t - now;
        let delay = until_stale.min(HEARTBEAT);
        tracing::trace!(
            delay = delay.0,
            until_stale = until_stale.0,
            "token not yet stale, sleeping"
        );
        tokio::time::sleep(Duration::from(delay)).await;
    }
}
