//! A storage backend persisted to a local JSON file

use std::{collections::BTreeMap, io, path::PathBuf};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, sync::Mutex};

use super::{SessionStorage, StorageChange, StorageError};

/// Storage persisted as a single JSON object on the local filesystem
///
/// Writes rewrite the whole file. On unix the file is created readable only
/// by its owner.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Constructs a new file storage at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, String>, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = match OpenOptions::new().read(true).open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err),
        };
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        if data.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let entries = serde_json::from_str(&data)?;
        Ok(entries)
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&self.path).await?;
        let data = serde_json::to_string_pretty(entries)?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_entries().await?.remove(key))
    }

    async fn apply(&self, changes: Vec<StorageChange>) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        for change in changes {
            match change {
                StorageChange::Set(key, value) => {
                    entries.insert(key.to_owned(), value);
                }
                StorageChange::Remove(key) => {
                    entries.remove(key);
                }
            }
        }
        self.write_entries(&entries).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("session.json"));
        assert_eq!(storage.read("authToken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batches_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let storage = FileStorage::new(&path);
        storage
            .apply(vec![
                StorageChange::Set("authToken", "a".into()),
                StorageChange::Set("user", "{}".into()),
            ])
            .await
            .unwrap();
        storage
            .apply(vec![StorageChange::Remove("user")])
            .await
            .unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.read("authToken").await.unwrap().as_deref(), Some("a"));
        assert_eq!(reopened.read("user").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_private_to_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        FileStorage::new(&path)
            .apply(vec![StorageChange::Set("authToken", "a".into())])
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileStorage::new(&path).read("authToken").await.is_err());
    }
}
