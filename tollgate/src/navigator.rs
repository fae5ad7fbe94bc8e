//! The seam between the session subsystem and the application's navigation

use std::sync::{Mutex, PoisonError};

/// The application's navigation surface
pub trait Navigator: Send + Sync {
    /// The location the user is currently on, if known
    fn current_path(&self) -> Option<String>;

    /// Sends the user to `location`
    fn navigate(&self, location: &str);
}

/// A navigator for headless use, which is never anywhere and goes nowhere
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNavigator;

impl Navigator for NullNavigator {
    #[inline]
    fn current_path(&self) -> Option<String> {
        None
    }

    #[inline]
    fn navigate(&self, _: &str) {}
}

/// A navigator that remembers where it was sent
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    current: Mutex<Option<String>>,
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    /// Constructs a navigator positioned at `path`
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(Some(path.into())),
            visits: Mutex::default(),
        }
    }

    /// Every location navigated to, oldest first
    pub fn visits(&self) -> Vec<String> {
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Navigator for RecordingNavigator {
    fn current_path(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn navigate(&self, location: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(location.to_owned());
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(location.to_owned());
    }
}
