use std::{fmt, sync::Arc};

use crate::{config::RedirectRules, navigator::Navigator, SessionStore, TerminalReason};

/// Ends a session after a terminal authentication failure
///
/// Clearing the store decides ownership: when several failing requests race
/// to tear the session down, only the one that actually removed it records
/// the redirect target and navigates.
#[derive(Clone)]
pub struct SessionTeardown {
    store: SessionStore,
    navigator: Arc<dyn Navigator>,
    rules: RedirectRules,
}

impl fmt::Debug for SessionTeardown {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionTeardown")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl SessionTeardown {
    /// Constructs a teardown over `store`, navigating with `navigator`
    pub fn new(store: SessionStore, navigator: Arc<dyn Navigator>, rules: RedirectRules) -> Self {
        Self {
            store,
            navigator,
            rules,
        }
    }

    /// Clears the session and sends the user to the login surface
    ///
    /// Returns `false` if there was no session left to end, in which case
    /// nothing else happens.
    pub async fn terminate(&self, reason: TerminalReason) -> bool {
        if !self.store.clear().await {
            tracing::trace!(%reason, "session already ended");
            return false;
        }

        match self.navigator.current_path() {
            Some(path) if self.rules.is_auth_path(&path) => {
                tracing::info!(%reason, %path, "session terminated while on sign-in flow");
            }
            current => {
                if let Some(path) = &current {
                    self.store.set_redirect_target(path).await;
                }
                let location = self.rules.login_location(reason);
                tracing::info!(%reason, %location, "session terminated, redirecting to login");
                self.navigator.navigate(&location);
            }
        }

        true
    }
}
