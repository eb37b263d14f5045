//! TimeEngine - the time accounting API shared by every client.
//!
//! The engine holds no state of its own: each operation reads the full
//! [`TimerState`] from the store, mutates it, and writes back only the keys
//! it touched. Operations issued through any clone of one engine are
//! serialized, so within a process each is atomic over the whole state.
//! Separate processes sharing a store are last-writer-wins per key.
//!
//! Invariants kept by every operation:
//! - at most one ticket is running;
//! - a ticket's total equals the sum of its phase buckets (time with no
//!   known phase lands in [`UNPHASED_BUCKET`]);
//! - a failed store write leaves the store as it was and is returned to the
//!   caller without retry.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use timer_core::{EngineConfig, MemoryStore, SystemClock, TimeEngine};
//!
//! let engine = TimeEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock),
//!     EngineConfig::default(),
//! );
//! engine.start("101").await?;
//! engine.on_phase_change("101", "Triagem").await?;
//! engine.pause().await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::{bounded_elapsed, Clock};
use crate::config::EngineConfig;
use crate::error::{Result, TimerError};
use crate::observer::PhaseFact;
use crate::report::{project, TimerReport};
use crate::store::{StateStore, StoreKey, TimerState};
use crate::sync::{OriginId, SyncNotifier};
use crate::types::{
    ActiveSession, Credit, PauseOutcome, PhaseChangeOutcome, ResetOutcome, StartOutcome,
    ToggleOutcome, UNPHASED_BUCKET,
};

const SESSION_KEYS: [StoreKey; 4] = [
    StoreKey::TicketTimers,
    StoreKey::PhaseTimers,
    StoreKey::ActiveTicket,
    StoreKey::TimerStartTime,
];

const TIME_KEYS: [StoreKey; 2] = [StoreKey::TicketTimers, StoreKey::PhaseTimers];

#[derive(Clone)]
pub struct TimeEngine {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    notifier: Option<SyncNotifier>,
    config: EngineConfig,
    op_guard: Arc<Mutex<()>>,
}

impl TimeEngine {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            notifier: None,
            config,
            op_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Publishes a sync signal after every state-changing operation.
    pub fn with_notifier(mut self, notifier: SyncNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// A handle that shares this engine's store and operation guard but tags
    /// its sync signals with `origin`.
    pub fn for_origin(&self, origin: OriginId) -> Self {
        let mut engine = self.clone();
        engine.notifier = self
            .notifier
            .as_ref()
            .map(|notifier| notifier.with_origin(origin));
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Session control
    // ─────────────────────────────────────────────────────────────────────────────

    /// Starts timing `ticket_id`, banking any other running ticket first.
    /// Starting the running ticket again is a no-op.
    pub async fn start(&self, ticket_id: &str) -> Result<StartOutcome> {
        let ticket_id = require_ticket(ticket_id)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        let now = self.clock.now();

        let outcome = self.apply_start(&mut state, ticket_id, now);
        if let StartOutcome::Started { session, paused } = &outcome {
            self.commit("start", &state, &SESSION_KEYS).await?;
            tracing::info!(
                ticket_id = %session.ticket_id,
                paused_ticket = paused.as_ref().map(|credit| credit.ticket_id.as_str()),
                "Timer started"
            );
        }
        Ok(outcome)
    }

    /// Stops the running ticket and banks its elapsed time. Idle is a no-op.
    pub async fn pause(&self) -> Result<PauseOutcome> {
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        let now = self.clock.now();

        match self.apply_pause(&mut state, now) {
            None => Ok(PauseOutcome::Idle),
            Some(credit) => {
                self.commit("pause", &state, &SESSION_KEYS).await?;
                tracing::info!(
                    ticket_id = %credit.ticket_id,
                    phase = %credit.phase,
                    seconds = credit.seconds,
                    "Timer paused"
                );
                Ok(PauseOutcome::Paused { credit })
            }
        }
    }

    /// Pauses `ticket_id` when it is the running ticket, otherwise starts it.
    pub async fn toggle(&self, ticket_id: &str) -> Result<ToggleOutcome> {
        let ticket_id = require_ticket(ticket_id)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        let now = self.clock.now();

        let outcome = match state.active_session() {
            Some(session) if session.ticket_id == ticket_id => {
                let credit = self.bank(&mut state, ticket_id, session.started_at, now);
                state.set_active_session(None);
                ToggleOutcome::Paused { credit }
            }
            _ => ToggleOutcome::Started {
                start: self.apply_start(&mut state, ticket_id, now),
            },
        };

        self.commit("toggle", &state, &SESSION_KEYS).await?;
        tracing::info!(ticket_id, outcome = ?outcome, "Timer toggled");
        Ok(outcome)
    }

    /// Returns the persisted session without touching it. A half-written
    /// session (ticket without start time, or the reverse) is cleared.
    pub async fn resume_on_load(&self) -> Result<Option<ActiveSession>> {
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;

        if state.has_half_session() {
            tracing::warn!(
                active_ticket = ?state.active_ticket,
                timer_start_time = ?state.timer_start_time,
                "Half-written session found, resetting to idle"
            );
            state.set_active_session(None);
            self.commit(
                "resume_on_load",
                &state,
                &[StoreKey::ActiveTicket, StoreKey::TimerStartTime],
            )
            .await?;
            return Ok(None);
        }

        Ok(state.active_session())
    }

    /// Automatic pause when the hosting page or process goes away.
    pub async fn on_process_teardown(&self) -> Result<PauseOutcome> {
        self.pause().await.map_err(|err| {
            tracing::warn!(error = %err, "Pause on teardown failed");
            err
        })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Phase tracking
    // ─────────────────────────────────────────────────────────────────────────────

    /// Records that `ticket_id` now sits in `new_phase`.
    ///
    /// For the running ticket, the interval since the later of its start and
    /// its last phase change is banked to the previous phase and the session
    /// restarts now. For any other ticket only the phase bookkeeping moves.
    pub async fn on_phase_change(
        &self,
        ticket_id: &str,
        new_phase: &str,
    ) -> Result<PhaseChangeOutcome> {
        let ticket_id = require_ticket(ticket_id)?;
        let new_phase = require_phase(new_phase)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        let now = self.clock.now();

        let (outcome, keys) = self.apply_phase_change(&mut state, ticket_id, new_phase, None, now);
        self.commit("phase_change", &state, &keys).await?;
        Ok(outcome)
    }

    /// Applies an observed board fact. Facts older than the last recorded
    /// change for the ticket are dropped. A title on the fact is cached in
    /// the same write.
    pub async fn observe_phase(&self, fact: &PhaseFact) -> Result<PhaseChangeOutcome> {
        let ticket_id = require_ticket(&fact.ticket_id)?;
        let new_phase = require_phase(&fact.phase)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        let now = self.clock.now();

        let (outcome, mut keys) =
            self.apply_phase_change(&mut state, ticket_id, new_phase, Some(fact.observed_at), now);
        if let Some(title) = fact.title.as_deref() {
            if apply_title(&mut state, ticket_id, title) {
                keys.push(StoreKey::TicketTitles);
            }
        }
        self.commit("observe_phase", &state, &keys).await?;
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Time records
    // ─────────────────────────────────────────────────────────────────────────────

    /// Clears the ticket's total and phase buckets. A running session on it
    /// stops and its in-flight interval is discarded. The current phase and
    /// title are kept; the phase's start moves to now.
    pub async fn reset_ticket(&self, ticket_id: &str) -> Result<ResetOutcome> {
        let ticket_id = require_ticket(ticket_id)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        let now = self.clock.now();

        let mut keys = Vec::new();
        let had_records = state.clear_ticket_time(ticket_id);
        if had_records {
            keys.extend(TIME_KEYS);
        }

        let stopped_session = state
            .active_session()
            .filter(|session| session.ticket_id == ticket_id);
        if stopped_session.is_some() {
            state.set_active_session(None);
            keys.extend([StoreKey::ActiveTicket, StoreKey::TimerStartTime]);
        }

        if state.current_phases.contains_key(ticket_id) {
            state.last_phase_change.insert(ticket_id.to_string(), now);
            keys.push(StoreKey::LastPhaseChange);
        }

        self.commit("reset_ticket", &state, &keys).await?;
        tracing::info!(ticket_id, had_records, stopped = stopped_session.is_some(), "Ticket reset");
        Ok(ResetOutcome {
            ticket_id: ticket_id.to_string(),
            had_records,
            stopped_session,
        })
    }

    /// Clears every timer, phase record and the session. Titles survive.
    /// Returns how many tickets had time recorded.
    pub async fn reset_all(&self) -> Result<usize> {
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;

        let cleared = state.ticket_timers.len();
        state.ticket_timers.clear();
        state.phase_timers.clear();
        state.current_phases.clear();
        state.last_phase_change.clear();
        state.last_phase_observed.clear();
        state.set_active_session(None);

        let keys: Vec<StoreKey> = StoreKey::ALL
            .into_iter()
            .filter(|key| *key != StoreKey::TicketTitles)
            .collect();
        self.commit("reset_all", &state, &keys).await?;
        tracing::info!(cleared, "All timers reset");
        Ok(cleared)
    }

    /// Adds `seconds` to the ticket's total and to `phase` (or the unphased
    /// bucket when no phase is given). `seconds` must be positive.
    pub async fn add_manual_time(
        &self,
        ticket_id: &str,
        phase: Option<&str>,
        seconds: i64,
    ) -> Result<Credit> {
        let ticket_id = require_ticket(ticket_id)?;
        if seconds <= 0 {
            return Err(TimerError::validation("seconds", "must be greater than zero"));
        }
        let seconds = seconds as u64;
        let bucket = phase
            .map(str::trim)
            .filter(|phase| !phase.is_empty())
            .unwrap_or(UNPHASED_BUCKET)
            .to_string();

        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;
        state.credit(ticket_id, &bucket, seconds);
        self.commit("add_manual_time", &state, &TIME_KEYS).await?;

        tracing::info!(ticket_id, phase = %bucket, seconds, "Manual time added");
        Ok(Credit {
            ticket_id: ticket_id.to_string(),
            phase: bucket,
            seconds,
            discarded: false,
        })
    }

    /// Overwrites the ticket's total. The unphased bucket absorbs the
    /// difference, so the total can't drop below the named phase buckets.
    pub async fn set_ticket_total(&self, ticket_id: &str, seconds: u64) -> Result<u64> {
        let ticket_id = require_ticket(ticket_id)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;

        let phases = state.phase_timers.entry(ticket_id.to_string()).or_default();
        let named: u64 = phases
            .iter()
            .filter(|(phase, _)| phase.as_str() != UNPHASED_BUCKET)
            .map(|(_, secs)| *secs)
            .sum();
        if seconds < named {
            return Err(TimerError::validation(
                "seconds",
                format!("total {} is below the {} seconds already in named phases", seconds, named),
            ));
        }

        let unphased = seconds - named;
        if unphased == 0 {
            phases.remove(UNPHASED_BUCKET);
        } else {
            phases.insert(UNPHASED_BUCKET.to_string(), unphased);
        }
        if phases.is_empty() {
            state.phase_timers.remove(ticket_id);
        }
        state.ticket_timers.insert(ticket_id.to_string(), seconds);

        self.commit("set_ticket_total", &state, &TIME_KEYS).await?;
        tracing::info!(ticket_id, seconds, "Ticket total updated");
        Ok(seconds)
    }

    /// Caches a display title. Returns whether anything was written.
    pub async fn record_title(&self, ticket_id: &str, title: &str) -> Result<bool> {
        let ticket_id = require_ticket(ticket_id)?;
        let _guard = self.op_guard.lock().await;
        let mut state = self.load().await?;

        if !apply_title(&mut state, ticket_id, title) {
            return Ok(false);
        }
        self.commit("record_title", &state, &[StoreKey::TicketTitles]).await?;
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn timer_data(&self) -> Result<TimerState> {
        self.load().await
    }

    pub async fn report(&self) -> Result<TimerReport> {
        let state = self.load().await?;
        Ok(project(&state, self.clock.now(), self.config.max_elapsed()))
    }

    /// Publishes a sync signal without changing anything.
    pub fn broadcast_refresh(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────────

    async fn load(&self) -> Result<TimerState> {
        TimerState::load(self.store.as_ref()).await
    }

    async fn commit(&self, operation: &str, state: &TimerState, keys: &[StoreKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Err(err) = state.persist(self.store.as_ref(), keys).await {
            tracing::warn!(operation, error = %err, "Store write failed");
            return Err(err);
        }
        self.broadcast_refresh();
        Ok(())
    }

    fn apply_start(
        &self,
        state: &mut TimerState,
        ticket_id: &str,
        now: DateTime<Utc>,
    ) -> StartOutcome {
        if let Some(session) = state.active_session() {
            if session.ticket_id == ticket_id {
                return StartOutcome::AlreadyRunning { session };
            }
        }

        let paused = self.apply_pause(state, now);
        state.ticket_timers.entry(ticket_id.to_string()).or_insert(0);
        let session = ActiveSession {
            ticket_id: ticket_id.to_string(),
            started_at: now,
        };
        state.set_active_session(Some(session.clone()));
        StartOutcome::Started { session, paused }
    }

    fn apply_pause(&self, state: &mut TimerState, now: DateTime<Utc>) -> Option<Credit> {
        let session = state.active_session()?;
        let credit = self.bank(state, &session.ticket_id, session.started_at, now);
        state.set_active_session(None);
        Some(credit)
    }

    fn apply_phase_change(
        &self,
        state: &mut TimerState,
        ticket_id: &str,
        new_phase: &str,
        observed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (PhaseChangeOutcome, Vec<StoreKey>) {
        let previous = state.current_phase(ticket_id).map(str::to_string);
        if previous.as_deref() == Some(new_phase) {
            return (PhaseChangeOutcome::Unchanged, Vec::new());
        }

        let last_observed = state.last_phase_observed.get(ticket_id).copied();
        if let (Some(observed_at), Some(last_observed)) = (observed_at, last_observed) {
            if observed_at < last_observed {
                tracing::debug!(
                    ticket_id,
                    phase = new_phase,
                    %observed_at,
                    %last_observed,
                    "Dropping stale phase fact"
                );
                return (PhaseChangeOutcome::Stale, Vec::new());
            }
        }

        let last_change = state.last_phase_change.get(ticket_id).copied();
        let mut keys = vec![
            StoreKey::CurrentPhases,
            StoreKey::LastPhaseChange,
            StoreKey::LastPhaseObserved,
        ];
        let running = state
            .active_session()
            .filter(|session| session.ticket_id == ticket_id);

        let credit = running.map(|session| {
            let from = last_change.map_or(session.started_at, |last| last.max(session.started_at));
            let credit = self.bank(state, ticket_id, from, now);
            state.timer_start_time = Some(now);
            keys.extend([StoreKey::TicketTimers, StoreKey::PhaseTimers, StoreKey::TimerStartTime]);
            credit
        });

        state
            .current_phases
            .insert(ticket_id.to_string(), new_phase.to_string());
        state.last_phase_change.insert(ticket_id.to_string(), now);
        state
            .last_phase_observed
            .insert(ticket_id.to_string(), observed_at.unwrap_or(now));

        tracing::info!(
            ticket_id,
            from = previous.as_deref(),
            to = new_phase,
            credited = credit.as_ref().map(|credit| credit.seconds),
            "Phase changed"
        );
        (
            PhaseChangeOutcome::Moved {
                from: previous,
                to: new_phase.to_string(),
                credit,
            },
            keys,
        )
    }

    /// Credits the interval `[from, now]` to the ticket's current phase.
    fn bank(
        &self,
        state: &mut TimerState,
        ticket_id: &str,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Credit {
        let phase = state
            .current_phase(ticket_id)
            .unwrap_or(UNPHASED_BUCKET)
            .to_string();

        let (seconds, discarded) = match bounded_elapsed(from, now, self.config.max_elapsed()) {
            Some(seconds) => (seconds, false),
            None => {
                tracing::warn!(
                    ticket_id,
                    %from,
                    %now,
                    max_days = self.config.max_elapsed_days,
                    "Elapsed interval exceeds sanity threshold, discarding"
                );
                (0, true)
            }
        };

        if seconds > 0 {
            state.credit(ticket_id, &phase, seconds);
        }
        Credit {
            ticket_id: ticket_id.to_string(),
            phase,
            seconds,
            discarded,
        }
    }
}

fn require_ticket(ticket_id: &str) -> Result<&str> {
    let ticket_id = ticket_id.trim();
    if ticket_id.is_empty() {
        return Err(TimerError::validation("ticket_id", "must not be blank"));
    }
    Ok(ticket_id)
}

fn require_phase(phase: &str) -> Result<&str> {
    let phase = phase.trim();
    if phase.is_empty() {
        return Err(TimerError::validation("phase", "must not be blank"));
    }
    Ok(phase)
}

fn apply_title(state: &mut TimerState, ticket_id: &str, title: &str) -> bool {
    let title = title.trim();
    if title.is_empty() || state.ticket_titles.get(ticket_id).map(String::as_str) == Some(title) {
        return false;
    }
    state
        .ticket_titles
        .insert(ticket_id.to_string(), title.to_string());
    true
}
