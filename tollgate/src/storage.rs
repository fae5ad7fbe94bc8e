//! Durable key/value storage backing the session store

use async_trait::async_trait;
use std::error;

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileStorage;
pub use in_memory::InMemoryStorage;

/// The error type returned by storage backends
pub type StorageError = Box<dyn error::Error + Send + Sync + 'static>;

/// A single change within a storage batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageChange {
    /// Set `key` to a value
    Set(&'static str, String),
    /// Remove `key`
    Remove(&'static str),
}

/// Client-side key/value storage
///
/// Batches passed to [`apply()`][Self::apply()] must be committed atomically
/// with respect to concurrent readers of the same backend.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Reads the value stored under `key`
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Applies a batch of changes
    async fn apply(&self, changes: Vec<StorageChange>) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: SessionStorage + ?Sized> SessionStorage for std::sync::Arc<S> {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).read(key).await
    }

    async fn apply(&self, changes: Vec<StorageChange>) -> Result<(), StorageError> {
        (**self).apply(changes).await
    }
}
