//! Shared value types returned by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase bucket for time that could not be attributed to a board column.
/// With it, a ticket's total always equals the sum of its buckets.
pub const UNPHASED_BUCKET: &str = "Sem fase";

/// The at-most-one running timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub ticket_id: String,
    pub started_at: DateTime<Utc>,
}

/// Time banked for one (ticket, phase) interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credit {
    pub ticket_id: String,
    pub phase: String,
    pub seconds: u64,
    /// Set when the interval exceeded the sanity threshold and was dropped.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub discarded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started {
        session: ActiveSession,
        #[serde(skip_serializing_if = "Option::is_none")]
        paused: Option<Credit>,
    },
    AlreadyRunning {
        session: ActiveSession,
    },
}

impl StartOutcome {
    pub fn session(&self) -> &ActiveSession {
        match self {
            StartOutcome::Started { session, .. } | StartOutcome::AlreadyRunning { session } => {
                session
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PauseOutcome {
    Idle,
    Paused { credit: Credit },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToggleOutcome {
    Started { start: StartOutcome },
    Paused { credit: Credit },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseChangeOutcome {
    /// The ticket already sits in the reported phase.
    Unchanged,
    /// The fact is older than the last recorded phase change.
    Stale,
    /// The phase moved. `credit` is present only for the running ticket.
    Moved {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        credit: Option<Credit>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub ticket_id: String,
    pub had_records: bool,
    /// The discarded in-flight interval, when the ticket was running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_session: Option<ActiveSession>,
}
