//! Single-file JSON store.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": {
//!     "ticketTimers": { "101": 120 },
//!     "activeTicket": null
//!   }
//! }
//! ```
//!
//! Empty, corrupt or unsupported-version files read as an empty store (with
//! a warning) so a damaged file never blocks the timer. Writes go through a
//! temp file + rename so readers never observe a partial document.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use super::{StateStore, StoreKey, StoreMap};
use crate::error::{Result, TimerError};

const FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    entries: StoreMap,
}

pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> Result<StoreMap> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_file(&path))
            .await
            .map_err(|err| TimerError::store("file read task", err))?
    }

    async fn write_entries(&self, entries: StoreMap) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_file(&path, entries))
            .await
            .map_err(|err| TimerError::store("file write task", err))?
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, keys: &[StoreKey]) -> Result<StoreMap> {
        let entries = self.read_entries().await?;
        let mut out = StoreMap::new();
        for key in keys {
            if let Some(value) = entries.get(key.as_str()) {
                out.insert(key.as_str().to_string(), value.clone());
            }
        }
        Ok(out)
    }

    async fn set(&self, entries: StoreMap) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut current = self.read_entries().await?;
        for (key, value) in entries {
            current.insert(key, value);
        }
        self.write_entries(current).await
    }

    async fn remove(&self, keys: &[StoreKey]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut current = self.read_entries().await?;
        for key in keys {
            current.remove(key.as_str());
        }
        self.write_entries(current).await
    }
}

fn read_file(path: &Path) -> Result<StoreMap> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(StoreMap::new()),
        Err(source) => {
            return Err(TimerError::Io {
                context: "read state file".to_string(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        tracing::warn!(path = %path.display(), "Empty state file, treating as empty store");
        return Ok(StoreMap::new());
    }

    match serde_json::from_str::<StoreFile>(&content) {
        Ok(file) if file.version == FILE_VERSION => Ok(file.entries),
        Ok(file) => {
            tracing::warn!(
                path = %path.display(),
                version = file.version,
                expected = FILE_VERSION,
                "Unsupported state file version, treating as empty store"
            );
            Ok(StoreMap::new())
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "Failed to parse state file, treating as empty store"
            );
            Ok(StoreMap::new())
        }
    }
}

fn write_file(path: &Path, entries: StoreMap) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TimerError::store("write state file", "path has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|source| TimerError::Io {
        context: "create state directory".to_string(),
        source,
    })?;

    let file = StoreFile {
        version: FILE_VERSION,
        entries,
    };
    let content = serde_json::to_string_pretty(&file).map_err(|source| TimerError::Json {
        context: "serialize state file".to_string(),
        source,
    })?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| TimerError::store("create temp state file", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| TimerError::store("write temp state file", err))?;
    temp_file
        .flush()
        .map_err(|err| TimerError::store("flush temp state file", err))?;
    temp_file
        .persist(path)
        .map_err(|err| TimerError::store("commit state file", err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileStore::new(dir.path().join("state.json"));
        let got = store.get(&StoreKey::ALL).await.expect("get");
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn set_merges_with_existing_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileStore::new(dir.path().join("nested").join("state.json"));

        let mut first = StoreMap::new();
        first.insert("ticketTimers".to_string(), json!({"1": 30}));
        store.set(first).await.expect("first set");

        let mut second = StoreMap::new();
        second.insert("activeTicket".to_string(), json!("1"));
        store.set(second).await.expect("second set");

        let got = store.get(&StoreKey::ALL).await.expect("get");
        assert_eq!(got["ticketTimers"], json!({"1": 30}));
        assert_eq!(got["activeTicket"], json!("1"));
    }

    #[tokio::test]
    async fn corrupt_file_reads_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").expect("write");
        let store = FileStore::new(&path);
        assert!(store.get(&StoreKey::ALL).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn wrong_version_reads_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 9, "entries": {"activeTicket": "1"}}"#)
            .expect("write");
        let store = FileStore::new(&path);
        assert!(store.get(&StoreKey::ALL).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn remove_drops_keys() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileStore::new(dir.path().join("state.json"));
        let mut entries = StoreMap::new();
        entries.insert("activeTicket".to_string(), json!("1"));
        entries.insert("ticketTitles".to_string(), json!({"1": "Printer"}));
        store.set(entries).await.expect("set");

        store.remove(&[StoreKey::ActiveTicket]).await.expect("remove");
        let got = store.get(&StoreKey::ALL).await.expect("get");
        assert!(!got.contains_key("activeTicket"));
        assert!(got.contains_key("ticketTitles"));
    }
}
