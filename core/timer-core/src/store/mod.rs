//! Durable state store contract.
//!
//! The store is a generic asynchronous key-value map, shaped after the
//! browser's extension storage: values are JSON, keys are the fixed set in
//! [`StoreKey`]. It serializes operations per key but offers no cross-key
//! transactions, so callers write only the keys they touched.
//!
//! [`TimerState`] is the typed view of those keys that the engine and the
//! reporting code operate on. Decoding is tolerant: a value that does not
//! parse is dropped with a warning, entry by entry, so one bad record never
//! locks every operation out of the store.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TimerError};
use crate::types::{ActiveSession, UNPHASED_BUCKET};

pub type StoreMap = serde_json::Map<String, Value>;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the requested keys that are present. Absent keys are omitted.
    async fn get(&self, keys: &[StoreKey]) -> Result<StoreMap>;

    /// Upserts every entry. Entries with a `null` value are stored as null.
    async fn set(&self, entries: StoreMap) -> Result<()>;

    async fn remove(&self, keys: &[StoreKey]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    TicketTimers,
    PhaseTimers,
    CurrentPhases,
    LastPhaseChange,
    LastPhaseObserved,
    ActiveTicket,
    TimerStartTime,
    TicketTitles,
}

impl StoreKey {
    pub const ALL: [StoreKey; 8] = [
        StoreKey::TicketTimers,
        StoreKey::PhaseTimers,
        StoreKey::CurrentPhases,
        StoreKey::LastPhaseChange,
        StoreKey::LastPhaseObserved,
        StoreKey::ActiveTicket,
        StoreKey::TimerStartTime,
        StoreKey::TicketTitles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::TicketTimers => "ticketTimers",
            StoreKey::PhaseTimers => "phaseTimers",
            StoreKey::CurrentPhases => "currentPhases",
            StoreKey::LastPhaseChange => "lastPhaseChange",
            StoreKey::LastPhaseObserved => "lastPhaseObserved",
            StoreKey::ActiveTicket => "activeTicket",
            StoreKey::TimerStartTime => "timerStartTime",
            StoreKey::TicketTitles => "ticketTitles",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        StoreKey::ALL.into_iter().find(|key| key.as_str() == value)
    }
}

/// Typed snapshot of every persisted entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    #[serde(default)]
    pub ticket_timers: BTreeMap<String, u64>,
    #[serde(default)]
    pub phase_timers: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub current_phases: BTreeMap<String, String>,
    /// When the current phase took effect in the engine; crediting starts here.
    #[serde(default)]
    pub last_phase_change: BTreeMap<String, DateTime<Utc>>,
    /// When the board observation behind the current phase was made.
    /// Facts observed before this are stale.
    #[serde(default)]
    pub last_phase_observed: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub active_ticket: Option<String>,
    #[serde(default)]
    pub timer_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ticket_titles: BTreeMap<String, String>,
}

impl TimerState {
    pub async fn load(store: &dyn StateStore) -> Result<Self> {
        let entries = store.get(&StoreKey::ALL).await?;
        Ok(Self::from_entries(&entries))
    }

    /// Writes only `keys`; other keys in the store are left alone.
    pub async fn persist(&self, store: &dyn StateStore, keys: &[StoreKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        store.set(self.to_entries(keys)?).await
    }

    pub fn from_entries(entries: &StoreMap) -> Self {
        let mut state = TimerState::default();
        for key in StoreKey::ALL {
            let value = match entries.get(key.as_str()) {
                Some(Value::Null) | None => continue,
                Some(value) => value,
            };
            match key {
                StoreKey::TicketTimers => state.ticket_timers = decode_map(key, "", value),
                StoreKey::PhaseTimers => {
                    state.phase_timers = decode_entries(key, "", value, |ticket_id, buckets| {
                        buckets
                            .is_object()
                            .then(|| decode_map(key, ticket_id, buckets))
                    })
                }
                StoreKey::CurrentPhases => state.current_phases = decode_map(key, "", value),
                StoreKey::LastPhaseChange => state.last_phase_change = decode_map(key, "", value),
                StoreKey::LastPhaseObserved => {
                    state.last_phase_observed = decode_map(key, "", value)
                }
                StoreKey::ActiveTicket => state.active_ticket = decode_value(key, value),
                StoreKey::TimerStartTime => state.timer_start_time = decode_value(key, value),
                StoreKey::TicketTitles => state.ticket_titles = decode_map(key, "", value),
            }
        }
        state.reconcile_totals();
        state
    }

    pub fn to_entries(&self, keys: &[StoreKey]) -> Result<StoreMap> {
        let mut entries = StoreMap::new();
        for key in keys {
            let value = match key {
                StoreKey::TicketTimers => serde_json::to_value(&self.ticket_timers),
                StoreKey::PhaseTimers => serde_json::to_value(&self.phase_timers),
                StoreKey::CurrentPhases => serde_json::to_value(&self.current_phases),
                StoreKey::LastPhaseChange => serde_json::to_value(&self.last_phase_change),
                StoreKey::LastPhaseObserved => serde_json::to_value(&self.last_phase_observed),
                StoreKey::ActiveTicket => serde_json::to_value(&self.active_ticket),
                StoreKey::TimerStartTime => serde_json::to_value(&self.timer_start_time),
                StoreKey::TicketTitles => serde_json::to_value(&self.ticket_titles),
            }
            .map_err(|source| TimerError::Json {
                context: format!("serialize {}", key.as_str()),
                source,
            })?;
            entries.insert(key.as_str().to_string(), value);
        }
        Ok(entries)
    }

    /// The running session, if both halves are present.
    pub fn active_session(&self) -> Option<ActiveSession> {
        match (&self.active_ticket, self.timer_start_time) {
            (Some(ticket_id), Some(started_at)) => Some(ActiveSession {
                ticket_id: ticket_id.clone(),
                started_at,
            }),
            _ => None,
        }
    }

    /// True when exactly one of `activeTicket`/`timerStartTime` is set.
    pub fn has_half_session(&self) -> bool {
        self.active_ticket.is_some() != self.timer_start_time.is_some()
    }

    pub fn set_active_session(&mut self, session: Option<ActiveSession>) {
        match session {
            Some(session) => {
                self.active_ticket = Some(session.ticket_id);
                self.timer_start_time = Some(session.started_at);
            }
            None => {
                self.active_ticket = None;
                self.timer_start_time = None;
            }
        }
    }

    pub fn total_seconds(&self, ticket_id: &str) -> u64 {
        self.ticket_timers.get(ticket_id).copied().unwrap_or(0)
    }

    pub fn phase_seconds(&self, ticket_id: &str, phase: &str) -> u64 {
        self.phase_timers
            .get(ticket_id)
            .and_then(|phases| phases.get(phase))
            .copied()
            .unwrap_or(0)
    }

    pub fn current_phase(&self, ticket_id: &str) -> Option<&str> {
        self.current_phases.get(ticket_id).map(String::as_str)
    }

    /// Adds `seconds` to the ticket total and to one phase bucket, keeping
    /// `total == sum(buckets)`.
    pub fn credit(&mut self, ticket_id: &str, bucket: &str, seconds: u64) {
        let total = self.ticket_timers.entry(ticket_id.to_string()).or_insert(0);
        *total = total.saturating_add(seconds);
        let phases = self.phase_timers.entry(ticket_id.to_string()).or_default();
        let slot = phases.entry(bucket.to_string()).or_insert(0);
        *slot = slot.saturating_add(seconds);
    }

    /// Restores `total == sum(buckets)` after decoding dropped a record:
    /// a missing or short total is raised to the bucket sum, and a total
    /// above it keeps the surplus in [`UNPHASED_BUCKET`].
    fn reconcile_totals(&mut self) {
        for (ticket_id, phases) in self.phase_timers.iter_mut() {
            let sum = phases.values().fold(0u64, |acc, seconds| acc.saturating_add(*seconds));
            let total = self.ticket_timers.get(ticket_id).copied();
            match total {
                Some(total) if total == sum => continue,
                None if sum == 0 => continue,
                _ => {}
            }
            let total = total.unwrap_or(0);
            tracing::warn!(ticket_id = %ticket_id, total, buckets = sum, "Repairing ticket total");
            if total > sum {
                let slot = phases.entry(UNPHASED_BUCKET.to_string()).or_insert(0);
                *slot = slot.saturating_add(total - sum);
            } else {
                self.ticket_timers.insert(ticket_id.clone(), sum);
            }
        }
    }

    /// Drops the ticket's time records. Phase bookkeeping and title survive.
    pub fn clear_ticket_time(&mut self, ticket_id: &str) -> bool {
        let had_total = self.ticket_timers.remove(ticket_id).is_some();
        let had_phases = self.phase_timers.remove(ticket_id).is_some();
        had_total || had_phases
    }
}

fn decode_value<T: DeserializeOwned + Default>(key: StoreKey, value: &Value) -> T {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => decoded,
        Err(err) => {
            tracing::warn!(key = key.as_str(), error = %err, "Dropping unreadable stored value");
            T::default()
        }
    }
}

fn decode_map<T: DeserializeOwned>(key: StoreKey, scope: &str, value: &Value) -> BTreeMap<String, T> {
    decode_entries(key, scope, value, |_, entry| serde_json::from_value(entry.clone()).ok())
}

/// Decodes a JSON object entry by entry; entries `decode` rejects are skipped.
fn decode_entries<T>(
    key: StoreKey,
    scope: &str,
    value: &Value,
    mut decode: impl FnMut(&str, &Value) -> Option<T>,
) -> BTreeMap<String, T> {
    let Some(object) = value.as_object() else {
        tracing::warn!(key = key.as_str(), scope, "Dropping stored value that is not an object");
        return BTreeMap::new();
    };
    let mut decoded = BTreeMap::new();
    for (name, entry) in object {
        match decode(name, entry) {
            Some(item) => {
                decoded.insert(name.clone(), item);
            }
            None => {
                tracing::warn!(key = key.as_str(), scope, entry = %name, "Dropping unreadable stored entry");
            }
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn keys_use_extension_storage_names() {
        let names: Vec<&str> = StoreKey::ALL.iter().map(StoreKey::as_str).collect();
        assert_eq!(
            names,
            vec![
                "ticketTimers",
                "phaseTimers",
                "currentPhases",
                "lastPhaseChange",
                "lastPhaseObserved",
                "activeTicket",
                "timerStartTime",
                "ticketTitles"
            ]
        );
        assert_eq!(StoreKey::from_str("phaseTimers"), Some(StoreKey::PhaseTimers));
        assert_eq!(StoreKey::from_str("nope"), None);
    }

    #[test]
    fn null_and_missing_entries_load_as_defaults() {
        let mut entries = StoreMap::new();
        entries.insert("activeTicket".to_string(), Value::Null);
        entries.insert("ticketTimers".to_string(), json!({"101": 120}));
        let state = TimerState::from_entries(&entries);
        assert_eq!(state.total_seconds("101"), 120);
        assert!(state.active_session().is_none());
        assert!(state.phase_timers.is_empty());
    }

    #[test]
    fn unreadable_values_are_dropped_entry_by_entry() {
        let mut entries = StoreMap::new();
        entries.insert("ticketTimers".to_string(), json!({"1": 12.5, "2": 30}));
        entries.insert(
            "phaseTimers".to_string(),
            json!({"2": {"Novo": 30}, "3": {"Novo": -1, "Backlog": 8}, "4": "oops"}),
        );
        entries.insert("timerStartTime".to_string(), json!("not-a-time"));
        entries.insert("activeTicket".to_string(), json!("2"));
        entries.insert("ticketTitles".to_string(), json!(["not", "a", "map"]));

        let state = TimerState::from_entries(&entries);
        assert_eq!(state.total_seconds("2"), 30);
        assert!(!state.ticket_timers.contains_key("1"));
        assert_eq!(state.phase_seconds("3", "Backlog"), 8);
        assert!(!state.phase_timers["3"].contains_key("Novo"));
        assert!(!state.phase_timers.contains_key("4"));
        assert_eq!(state.timer_start_time, None);
        assert!(state.has_half_session());
        assert!(state.ticket_titles.is_empty());
    }

    #[test]
    fn decoding_repairs_totals_against_buckets() {
        let mut entries = StoreMap::new();
        entries.insert("ticketTimers".to_string(), json!({"1": "x", "2": 50, "3": 5}));
        entries.insert(
            "phaseTimers".to_string(),
            json!({"1": {"Novo": 20}, "2": {"Novo": 30}, "3": {"Novo": 9}}),
        );

        let state = TimerState::from_entries(&entries);
        assert_eq!(state.total_seconds("1"), 20);
        assert_eq!(state.total_seconds("2"), 50);
        assert_eq!(state.phase_seconds("2", UNPHASED_BUCKET), 20);
        assert_eq!(state.total_seconds("3"), 9);
        for (ticket_id, phases) in &state.phase_timers {
            assert_eq!(state.total_seconds(ticket_id), phases.values().sum::<u64>());
        }
    }

    #[test]
    fn timestamps_round_trip_as_rfc3339() {
        let started = Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap();
        let mut state = TimerState::default();
        state.set_active_session(Some(ActiveSession {
            ticket_id: "7".to_string(),
            started_at: started,
        }));
        let entries = state
            .to_entries(&[StoreKey::ActiveTicket, StoreKey::TimerStartTime])
            .expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["timerStartTime"], json!("2026-01-30T12:00:00Z"));
        let reloaded = TimerState::from_entries(&entries);
        assert_eq!(reloaded.active_session(), state.active_session());
    }

    #[test]
    fn credit_keeps_total_equal_to_buckets() {
        let mut state = TimerState::default();
        state.credit("1", "Novo", 10);
        state.credit("1", "Backlog", 5);
        state.credit("1", "Novo", 1);
        assert_eq!(state.total_seconds("1"), 16);
        let sum: u64 = state.phase_timers["1"].values().sum();
        assert_eq!(sum, 16);
    }

    #[test]
    fn half_session_detected() {
        let mut state = TimerState::default();
        state.active_ticket = Some("1".to_string());
        assert!(state.has_half_session());
        assert!(state.active_session().is_none());
    }
}
