use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{StateStore, StoreKey, StoreMap};
use crate::error::{Result, TimerError};

/// In-process store. Clones are independent; share one through `Arc` to
/// model several engines over the same storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<StoreMap>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: StoreMap) -> Self {
        Self {
            entries: Mutex::new(entries),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub async fn dump(&self) -> StoreMap {
        self.entries.lock().await.clone()
    }

    /// Makes every subsequent `set`/`remove` fail until switched off.
    #[cfg(any(test, feature = "test-helpers"))]
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TimerError::store("memory write", "writes disabled"));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, keys: &[StoreKey]) -> Result<StoreMap> {
        let entries = self.entries.lock().await;
        let mut out = StoreMap::new();
        for key in keys {
            if let Some(value) = entries.get(key.as_str()) {
                out.insert(key.as_str().to_string(), value.clone());
            }
        }
        Ok(out)
    }

    async fn set(&self, entries: StoreMap) -> Result<()> {
        self.check_writable()?;
        let mut current = self.entries.lock().await;
        for (key, value) in entries {
            current.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[StoreKey]) -> Result<()> {
        self.check_writable()?;
        let mut current = self.entries.lock().await;
        for key in keys {
            current.remove(key.as_str());
        }
        Ok(())
    }
}
