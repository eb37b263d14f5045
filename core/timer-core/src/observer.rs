//! Phase observer: turns board activity into engine phase facts.
//!
//! The board page is modeled as a [`BoardSource`] that can be scanned in
//! full, plus a stream of [`BoardEvent`]s. The observer rescans on a fixed
//! schedule after load (content appears late), coalesces event bursts, and
//! forwards the newest fact per ticket to [`TimeEngine::observe_phase`].
//!
//! The retry schedule only concerns board discovery. The engine never
//! retries store writes; failures are logged here and the observer moves on.
//!
//! Neither binary in this workspace runs an observer: the daemon receives
//! facts one at a time over `update_ticket_phase`. A process that can see
//! the board and owns an engine builds one with
//! `PhaseObserver::new(engine, &config.observer)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::config::ObserverConfig;
use crate::engine::TimeEngine;
use crate::error::Result;

/// "Ticket `ticket_id` was seen in column `phase` at `observed_at`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFact {
    pub ticket_id: String,
    pub phase: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    CardAdded(PhaseFact),
    CardMoved(PhaseFact),
    CardRemoved { ticket_id: String },
    ColumnsChanged,
}

#[async_trait]
pub trait BoardSource: Send + Sync {
    /// Every card currently on the board with its column.
    async fn scan(&self) -> Result<Vec<PhaseFact>>;
}

/// Scan offsets measured from observer start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    offsets: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(mut offsets: Vec<Duration>) -> Self {
        offsets.sort();
        Self { offsets }
    }

    pub fn offsets(&self) -> &[Duration] {
        &self.offsets
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(ObserverConfig::default().retry_delays())
    }
}

/// A coalesced batch of board activity.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Burst {
    pub facts: Vec<PhaseFact>,
    pub rescan: bool,
}

/// Collects events until the board has been quiet for `quiet`.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    deadline: Option<Instant>,
    facts: BTreeMap<String, PhaseFact>,
    rescan: bool,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
            facts: BTreeMap::new(),
            rescan: false,
        }
    }

    pub fn push(&mut self, event: BoardEvent, now: Instant) {
        match event {
            BoardEvent::CardAdded(fact) | BoardEvent::CardMoved(fact) => {
                let newer = self
                    .facts
                    .get(&fact.ticket_id)
                    .map_or(true, |held| fact.observed_at >= held.observed_at);
                if newer {
                    self.facts.insert(fact.ticket_id.clone(), fact);
                }
            }
            BoardEvent::ColumnsChanged => self.rescan = true,
            BoardEvent::CardRemoved { ticket_id } => {
                tracing::debug!(%ticket_id, "Card left the board");
                return;
            }
        }
        self.deadline = Some(now + self.quiet);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn take(&mut self) -> Burst {
        self.deadline = None;
        Burst {
            facts: std::mem::take(&mut self.facts).into_values().collect(),
            rescan: std::mem::replace(&mut self.rescan, false),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    pub scans: usize,
    pub facts_applied: usize,
    pub errors: usize,
}

pub struct PhaseObserver {
    engine: TimeEngine,
    retry: RetrySchedule,
    debounce: Duration,
}

impl PhaseObserver {
    pub fn new(engine: TimeEngine, config: &ObserverConfig) -> Self {
        Self {
            engine,
            retry: RetrySchedule::new(config.retry_delays()),
            debounce: config.debounce(),
        }
    }

    /// Runs until `shutdown` flips to true, or until the event stream has
    /// closed and the retry schedule is exhausted. Pending events are
    /// flushed before returning.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<BoardEvent>,
        source: Arc<dyn BoardSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ObserverStats {
        let started = Instant::now();
        let mut stats = ObserverStats::default();
        let mut debouncer = Debouncer::new(self.debounce);
        let mut retries = self.retry.offsets().iter().map(|offset| started + *offset);
        let mut next_retry = retries.next();
        let mut events_open = true;

        loop {
            if !events_open && next_retry.is_none() && debouncer.deadline().is_none() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Phase observer shutting down");
                        break;
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => debouncer.push(event, Instant::now()),
                    None => events_open = false,
                },
                _ = sleep_until(next_retry.unwrap_or(started)), if next_retry.is_some() => {
                    tracing::debug!(attempt = stats.scans + 1, "Scheduled board scan");
                    self.scan_and_apply(source.as_ref(), &mut stats).await;
                    next_retry = retries.next();
                }
                _ = sleep_until(debouncer.deadline().unwrap_or(started)), if debouncer.deadline().is_some() => {
                    let burst = debouncer.take();
                    self.apply_burst(burst, source.as_ref(), &mut stats).await;
                }
            }
        }

        if debouncer.deadline().is_some() {
            let burst = debouncer.take();
            self.apply_burst(burst, source.as_ref(), &mut stats).await;
        }

        tracing::info!(
            scans = stats.scans,
            facts_applied = stats.facts_applied,
            errors = stats.errors,
            "Phase observer stopped"
        );
        stats
    }

    async fn apply_burst(&self, burst: Burst, source: &dyn BoardSource, stats: &mut ObserverStats) {
        if burst.rescan {
            // card facts older than this scan are then dropped as stale
            self.scan_and_apply(source, stats).await;
        }
        self.apply_facts(burst.facts, stats).await;
    }

    async fn scan_and_apply(&self, source: &dyn BoardSource, stats: &mut ObserverStats) {
        stats.scans += 1;
        match source.scan().await {
            Ok(facts) => self.apply_facts(facts, stats).await,
            Err(err) => {
                stats.errors += 1;
                tracing::warn!(error = %err, "Board scan failed");
            }
        }
    }

    async fn apply_facts(&self, facts: Vec<PhaseFact>, stats: &mut ObserverStats) {
        for fact in facts {
            match self.engine.observe_phase(&fact).await {
                Ok(outcome) => {
                    stats.facts_applied += 1;
                    tracing::debug!(ticket_id = %fact.ticket_id, phase = %fact.phase, ?outcome, "Phase fact applied");
                }
                Err(err) => {
                    stats.errors += 1;
                    tracing::warn!(
                        ticket_id = %fact.ticket_id,
                        phase = %fact.phase,
                        error = %err,
                        "Failed to apply phase fact"
                    );
                }
            }
        }
    }
}
