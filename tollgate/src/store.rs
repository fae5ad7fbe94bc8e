use std::{fmt, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{watch, Mutex};
use tollgate_clock::UnixTime;

use crate::{
    storage::{SessionStorage, StorageChange},
    AccessToken, RefreshToken, RefreshTokenRef, Session, UserRecord,
};

const AUTH_TOKEN: &str = "authToken";
const REFRESH_TOKEN: &str = "refreshToken";
const TOKEN_EXPIRY: &str = "tokenExpiry";
const USER: &str = "user";
const REDIRECT_AFTER_LOGIN: &str = "redirectAfterLogin";

/// A shared handle to the current session
///
/// The in-memory copy is authoritative for the running process and is
/// published through a watch channel, so reads never wait on storage and
/// never observe a partially written session. Every change is also written
/// through to durable [`SessionStorage`]; storage failures are logged and do
/// not prevent the change from taking effect in memory.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    storage: Box<dyn SessionStorage>,
    current: watch::Sender<Option<Arc<Session>>>,
    writes: Mutex<()>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("current", &*self.inner.current.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Opens a store, resuming any session persisted in `storage`
    ///
    /// Incomplete or unreadable persisted state is discarded and the store
    /// starts without a session.
    pub async fn open<S>(storage: S) -> Self
    where
        S: SessionStorage + 'static,
    {
        let resumed = match load_session(&storage).await {
            Ok(Some(session)) => {
                tracing::info!(
                    user.id = %session.user().id,
                    expires_at = session.expires_at().map(|t| t.0),
                    has_refresh_token = session.refresh_token().is_some(),
                    "resumed persisted session"
                );
                Some(Arc::new(session))
            }
            Ok(None) => {
                tracing::debug!("no persisted session");
                None
            }
            Err(error) => {
                tracing::warn!(%error, "discarding unreadable persisted session");
                if let Err(error) = storage.apply(session_removals()).await {
                    tracing::warn!(error = (&*error as &dyn std::error::Error), "unable to remove unreadable session");
                }
                None
            }
        };

        let (current, _) = watch::channel(resumed);

        Self {
            inner: Arc::new(StoreInner {
                storage: Box::new(storage),
                current,
                writes: Mutex::new(()),
            }),
        }
    }

    /// The latest committed session, if any
    #[inline]
    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner.current.borrow().clone()
    }

    /// Whether a session is currently established
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.inner.current.borrow().is_some()
    }

    /// Subscribes to session changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Session>>> {
        self.inner.current.subscribe()
    }

    /// Replaces the current session wholesale
    pub async fn replace(&self, session: Session) {
        let _write = self.inner.writes.lock().await;
        self.persist(session_entries(&session)).await;
        self.inner.current.send_replace(Some(Arc::new(session)));
    }

    /// Commits a renewed session, but only if the session being renewed is
    /// still current
    ///
    /// Returns `false` without writing anything if the current session no
    /// longer carries `renewed_from`, as happens when the session ended while
    /// the renewal was in flight.
    pub async fn renew(&self, renewed_from: &RefreshTokenRef, session: Session) -> bool {
        let _write = self.inner.writes.lock().await;
        let still_current = self
            .current()
            .is_some_and(|current| current.refresh_token() == Some(renewed_from));

        if !still_current {
            tracing::debug!("session changed during renewal, discarding renewed session");
            return false;
        }

        self.persist(session_entries(&session)).await;
        self.inner.current.send_replace(Some(Arc::new(session)));
        true
    }

    /// Removes the current session
    ///
    /// Returns `true` only for the call that actually removed a session, so
    /// concurrent teardown paths can tell which one of them owns the side
    /// effects.
    pub async fn clear(&self) -> bool {
        let _write = self.inner.writes.lock().await;
        if self.inner.current.send_replace(None).is_none() {
            return false;
        }

        self.persist(session_removals()).await;
        true
    }

    /// Records where the user should land after signing in again
    pub async fn set_redirect_target(&self, path: &str) {
        self.persist(vec![StorageChange::Set(REDIRECT_AFTER_LOGIN, path.to_owned())])
            .await;
    }

    /// Returns and forgets the recorded post-login redirect target
    pub async fn take_redirect_target(&self) -> Option<String> {
        let _write = self.inner.writes.lock().await;
        let target = match self.inner.storage.read(REDIRECT_AFTER_LOGIN).await {
            Ok(target) => target,
            Err(error) => {
                tracing::warn!(error = (&*error as &dyn std::error::Error), "unable to read redirect target");
                None
            }
        };

        if target.is_some() {
            self.persist(vec![StorageChange::Remove(REDIRECT_AFTER_LOGIN)])
                .await;
        }

        target
    }

    async fn persist(&self, changes: Vec<StorageChange>) {
        if let Err(error) = self.inner.storage.apply(changes).await {
            tracing::warn!(
                error = (&*error as &dyn std::error::Error),
                "unable to persist session change, continuing with in-memory session"
            );
        }
    }
}

fn session_entries(session: &Session) -> Vec<StorageChange> {
    let mut changes = vec![StorageChange::Set(
        AUTH_TOKEN,
        session.access_token().as_str().to_owned(),
    )];

    changes.push(match session.refresh_token() {
        Some(token) => StorageChange::Set(REFRESH_TOKEN, token.as_str().to_owned()),
        None => StorageChange::Remove(REFRESH_TOKEN),
    });

    changes.push(match session.expires_at() {
        Some(expiry) => StorageChange::Set(TOKEN_EXPIRY, encode_expiry(expiry)),
        None => StorageChange::Remove(TOKEN_EXPIRY),
    });

    match serde_json::to_string(session.user()) {
        Ok(user) => changes.push(StorageChange::Set(USER, user)),
        Err(error) => tracing::warn!(%error, "unable to serialize user record"),
    }

    changes
}

fn session_removals() -> Vec<StorageChange> {
    vec![
        StorageChange::Remove(AUTH_TOKEN),
        StorageChange::Remove(REFRESH_TOKEN),
        StorageChange::Remove(TOKEN_EXPIRY),
        StorageChange::Remove(USER),
    ]
}

#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("persisted user record is unreadable")]
    User(#[from] serde_json::Error),
    #[error("persisted user record is missing")]
    MissingUser,
    #[error("persisted token expiry `{0}` is not an ISO-8601 timestamp")]
    Expiry(String),
}

async fn load_session(storage: &dyn SessionStorage) -> Result<Option<Session>, LoadError> {
    let Some(access_token) = storage.read(AUTH_TOKEN).await? else {
        return Ok(None);
    };

    let user: UserRecord = match storage.read(USER).await? {
        Some(user) => serde_json::from_str(&user)?,
        None => return Err(LoadError::MissingUser),
    };

    let refresh_token = storage.read(REFRESH_TOKEN).await?.map(RefreshToken::new);

    let expires_at = match storage.read(TOKEN_EXPIRY).await? {
        Some(expiry) => Some(decode_expiry(&expiry).ok_or(LoadError::Expiry(expiry))?),
        None => None,
    };

    Ok(Some(Session::new(
        AccessToken::new(access_token),
        refresh_token,
        expires_at,
        user,
    )))
}

/// 9999-12-31T23:59:59Z, the last instant with a four-digit year
const LATEST_EXPIRY: UnixTime = UnixTime(253_402_300_799);

fn encode_expiry(expiry: UnixTime) -> String {
    let secs = i64::try_from(expiry.min(LATEST_EXPIRY).0).unwrap_or(0);
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn decode_expiry(expiry: &str) -> Option<UnixTime> {
    let parsed = DateTime::parse_from_rfc3339(expiry.trim()).ok()?;
    Some(UnixTime(u64::try_from(parsed.timestamp()).unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::InMemoryStorage, Role};

    fn session(access: &'static str, refresh: Option<&'static str>) -> Session {
        Session::new(
            AccessToken::from_static(access),
            refresh.map(RefreshToken::from_static),
            Some(UnixTime(1_700_000_000)),
            UserRecord {
                id: "42".into(),
                email: "grace@example.com".into(),
                role: Role::Parent,
                profile: None,
            },
        )
    }

    #[test]
    fn expiry_round_trips_through_iso_8601() {
        let encoded = encode_expiry(UnixTime(1_700_000_000));
        assert_eq!(encoded, "2023-11-14T22:13:20Z");
        assert_eq!(decode_expiry(&encoded), Some(UnixTime(1_700_000_000)));
        assert_eq!(
            decode_expiry("2023-11-14T23:13:20.500+01:00"),
            Some(UnixTime(1_700_000_000))
        );
        assert_eq!(decode_expiry("tomorrow"), None);
    }

    #[test]
    fn far_future_expiry_is_clamped_to_a_readable_instant() {
        let encoded = encode_expiry(UnixTime(u64::MAX));
        assert_eq!(encoded, "9999-12-31T23:59:59Z");
        assert_eq!(decode_expiry(&encoded), Some(LATEST_EXPIRY));
    }

    #[tokio::test]
    async fn far_future_session_survives_reopening() {
        let storage = Arc::new(InMemoryStorage::new());
        let far = session("access-1", Some("refresh-1"));
        SessionStore::open(storage.clone())
            .await
            .replace(Session::new(
                far.access_token().to_owned(),
                far.refresh_token().map(ToOwned::to_owned),
                Some(UnixTime(u64::MAX)),
                far.user().clone(),
            ))
            .await;

        let reopened = SessionStore::open(storage).await;
        let resumed = reopened.current().expect("session resumed");
        assert_eq!(resumed.expires_at(), Some(LATEST_EXPIRY));
        assert_eq!(resumed.access_token().as_str(), "access-1");
    }

    #[tokio::test]
    async fn writes_use_the_well_known_keys() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = SessionStore::open(storage.clone()).await;

        store.replace(session("access-1", Some("refresh-1"))).await;

        let entries = storage.snapshot();
        assert_eq!(entries["authToken"], "access-1");
        assert_eq!(entries["refreshToken"], "refresh-1");
        assert_eq!(entries["tokenExpiry"], "2023-11-14T22:13:20Z");
        assert!(entries["user"].contains("grace@example.com"));
    }

    #[tokio::test]
    async fn persisted_session_is_resumed() {
        let storage = Arc::new(InMemoryStorage::new());
        SessionStore::open(storage.clone())
            .await
            .replace(session("access-1", None))
            .await;

        let reopened = SessionStore::open(storage.clone()).await;
        let resumed = reopened.current().expect("session resumed");
        assert_eq!(*resumed, session("access-1", None));
        assert!(!storage.snapshot().contains_key("refreshToken"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn unreadable_session_is_discarded() {
        let storage = Arc::new(InMemoryStorage::with_entries([
            ("authToken", "access-1"),
            ("user", "{not json"),
            ("redirectAfterLogin", "/reports"),
        ]));

        let store = SessionStore::open(storage.clone()).await;
        assert!(store.current().is_none());

        let entries = storage.snapshot();
        assert!(!entries.contains_key("authToken"));
        assert_eq!(entries["redirectAfterLogin"], "/reports");
        assert!(logs_contain("discarding unreadable persisted session"));
    }

    #[tokio::test]
    async fn only_the_first_clear_reports_removal() {
        let store = SessionStore::open(InMemoryStorage::new()).await;
        store.replace(session("access-1", Some("refresh-1"))).await;

        let mut watcher = store.subscribe();
        assert!(store.clear().await);
        assert!(!store.clear().await);
        assert!(watcher.has_changed().unwrap());
        assert!(watcher.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn renewal_is_discarded_once_session_has_ended() {
        let store = SessionStore::open(InMemoryStorage::new()).await;
        store.replace(session("access-1", Some("refresh-1"))).await;

        let from = RefreshToken::from_static("refresh-1");
        assert!(store.renew(&from, session("access-2", Some("refresh-1"))).await);
        assert_eq!(store.current().unwrap().access_token().as_str(), "access-2");

        store.clear().await;
        assert!(!store.renew(&from, session("access-3", Some("refresh-1"))).await);
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn redirect_target_is_taken_once() {
        let store = SessionStore::open(InMemoryStorage::new()).await;
        store.set_redirect_target("/classes/7").await;
        assert_eq!(store.take_redirect_target().await.as_deref(), Some("/classes/7"));
        assert_eq!(store.take_redirect_target().await, None);
    }
}
