//! Startup and teardown hooks for whatever process hosts the engine.

use std::fmt;
use std::time::Duration;

use crate::engine::TimeEngine;
use crate::types::{ActiveSession, PauseOutcome};

/// Why the host is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The page hosting the board was closed.
    TabClosed,
    /// The process received a termination signal.
    Signal,
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TeardownReason::TabClosed => "tab_closed",
            TeardownReason::Signal => "signal",
            TeardownReason::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Resumes a persisted session, if any. Errors are logged and treated as
/// "nothing to resume".
pub async fn on_startup(engine: &TimeEngine) -> Option<ActiveSession> {
    match engine.resume_on_load().await {
        Ok(Some(session)) => {
            tracing::info!(
                ticket_id = %session.ticket_id,
                started_at = %session.started_at,
                "Resumed running timer"
            );
            Some(session)
        }
        Ok(None) => {
            tracing::debug!("No running timer to resume");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to resume timer state");
            None
        }
    }
}

/// Best-effort pause with a bounded wait. Never fails; the outcome is
/// `None` when the pause errored or timed out.
pub async fn on_teardown(
    engine: &TimeEngine,
    reason: TeardownReason,
    timeout: Duration,
) -> Option<PauseOutcome> {
    match tokio::time::timeout(timeout, engine.on_process_teardown()).await {
        Ok(Ok(outcome)) => {
            if let PauseOutcome::Paused { credit } = &outcome {
                tracing::info!(
                    %reason,
                    ticket_id = %credit.ticket_id,
                    seconds = credit.seconds,
                    "Paused running timer on teardown"
                );
            }
            Some(outcome)
        }
        Ok(Err(err)) => {
            tracing::warn!(%reason, error = %err, "Teardown pause failed");
            None
        }
        Err(_) => {
            tracing::warn!(%reason, timeout_ms = timeout.as_millis() as u64, "Teardown pause timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::error::Result;
    use crate::store::{MemoryStore, StateStore, StoreKey, StoreMap};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn setup() -> (TimeEngine, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let engine = TimeEngine::new(store.clone(), Arc::new(clock.clone()), EngineConfig::default());
        (engine, store, clock)
    }

    #[tokio::test]
    async fn startup_returns_running_session() {
        let (engine, _store, _clock) = setup();
        assert!(on_startup(&engine).await.is_none());
        engine.start("42").await.expect("start");
        let session = on_startup(&engine).await.expect("session");
        assert_eq!(session.ticket_id, "42");
    }

    #[tokio::test]
    async fn teardown_banks_running_time() {
        let (engine, _store, clock) = setup();
        engine.start("42").await.expect("start");
        clock.advance_secs(33);

        let outcome = on_teardown(&engine, TeardownReason::TabClosed, Duration::from_secs(2)).await;
        assert!(matches!(outcome, Some(PauseOutcome::Paused { ref credit }) if credit.seconds == 33));
        let state = engine.timer_data().await.expect("state");
        assert!(state.active_session().is_none());
    }

    #[tokio::test]
    async fn teardown_write_failure_is_swallowed() {
        let (engine, store, clock) = setup();
        engine.start("42").await.expect("start");
        clock.advance_secs(5);
        store.fail_writes(true);

        let outcome = on_teardown(&engine, TeardownReason::Signal, Duration::from_secs(2)).await;
        assert!(outcome.is_none());
    }

    struct StalledStore;

    #[async_trait]
    impl StateStore for StalledStore {
        async fn get(&self, _keys: &[StoreKey]) -> Result<StoreMap> {
            std::future::pending().await
        }

        async fn set(&self, _entries: StoreMap) -> Result<()> {
            std::future::pending().await
        }

        async fn remove(&self, _keys: &[StoreKey]) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_gives_up_after_timeout() {
        let engine = TimeEngine::new(
            Arc::new(StalledStore),
            Arc::new(ManualClock::new(Utc::now())),
            EngineConfig::default(),
        );
        let outcome = on_teardown(&engine, TeardownReason::Shutdown, Duration::from_secs(2)).await;
        assert!(outcome.is_none());
    }
}
