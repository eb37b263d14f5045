//! [`StateStore`] backed by the daemon's SQLite database.

use std::sync::Arc;

use async_trait::async_trait;
use timer_core::{StateStore, StoreKey, StoreMap, TimerError};

use crate::db::Db;

pub struct SqliteStore {
    db: Arc<Db>,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self { db: Arc::new(db) }
    }

    async fn blocking<T, F>(&self, context: &'static str, op: F) -> timer_core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, String> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|err| TimerError::store(context, err))?
            .map_err(|err| TimerError::store(context, err))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, keys: &[StoreKey]) -> timer_core::Result<StoreMap> {
        let keys = keys.to_vec();
        self.blocking("sqlite get", move |db| db.get_entries(&keys))
            .await
    }

    async fn set(&self, entries: StoreMap) -> timer_core::Result<()> {
        self.blocking("sqlite set", move |db| db.set_entries(&entries))
            .await
    }

    async fn remove(&self, keys: &[StoreKey]) -> timer_core::Result<()> {
        let keys = keys.to_vec();
        self.blocking("sqlite remove", move |db| db.remove_keys(&keys))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use timer_core::{EngineConfig, ManualClock, TimeEngine};

    #[tokio::test]
    async fn engine_round_trips_through_sqlite() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.db");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap());

        let engine = TimeEngine::new(
            Arc::new(SqliteStore::new(Db::new(path.clone()).expect("db"))),
            Arc::new(clock.clone()),
            EngineConfig::default(),
        );
        engine.on_phase_change("300", "Backlog").await.expect("phase");
        engine.start("300").await.expect("start");
        clock.advance_secs(75);

        let reopened = TimeEngine::new(
            Arc::new(SqliteStore::new(Db::new(path).expect("reopen"))),
            Arc::new(clock.clone()),
            EngineConfig::default(),
        );
        let session = reopened.resume_on_load().await.expect("resume");
        assert_eq!(session.map(|s| s.ticket_id), Some("300".to_string()));
        reopened.pause().await.expect("pause");

        let state = reopened.timer_data().await.expect("state");
        assert_eq!(state.phase_seconds("300", "Backlog"), 75);
        assert_eq!(state.total_seconds("300"), 75);
    }
}
