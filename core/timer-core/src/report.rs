//! Reporting projector: read-only views over [`TimerState`].
//!
//! Every view (list, detail, CSV export) goes through [`project`], so the
//! running ticket's live elapsed time is counted the same way everywhere.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::bounded_elapsed;
use crate::store::TimerState;
use crate::types::{ActiveSession, UNPHASED_BUCKET};

pub const UNKNOWN_OWNER: &str = "Desconhecido";
pub const UNKNOWN_CDA: &str = "Não informado";
pub const UNKNOWN_STATUS: &str = "Desconhecido";

const CSV_BASE_HEADER: &str = "ID do Ticket,Título,Proprietário,CDA Responsável,Status,Tempo Total";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRow {
    pub ticket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub total_seconds: u64,
    #[serde(default)]
    pub phases: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub active: bool,
}

impl TicketRow {
    /// The cached title, or `Ticket #<id>` when none was ever seen.
    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Ticket #{}", self.ticket_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerReport {
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveSession>,
    pub rows: Vec<TicketRow>,
}

impl TimerReport {
    pub fn row(&self, ticket_id: &str) -> Option<&TicketRow> {
        self.rows.iter().find(|row| row.ticket_id == ticket_id)
    }
}

/// Builds one row per ticket in `ticketTimers` (plus the running ticket),
/// ordered by total descending, then id.
pub fn project(state: &TimerState, now: DateTime<Utc>, max_elapsed: Duration) -> TimerReport {
    let active = state.active_session();

    let mut ticket_ids: Vec<&String> = state.ticket_timers.keys().collect();
    if let Some(session) = &active {
        if !state.ticket_timers.contains_key(&session.ticket_id) {
            ticket_ids.push(&session.ticket_id);
        }
    }

    let mut rows: Vec<TicketRow> = ticket_ids
        .into_iter()
        .map(|ticket_id| {
            let current_phase = state.current_phase(ticket_id).map(str::to_string);
            let mut total_seconds = state.total_seconds(ticket_id);
            let mut phases = state.phase_timers.get(ticket_id).cloned().unwrap_or_default();

            let is_active = active
                .as_ref()
                .is_some_and(|session| &session.ticket_id == ticket_id);
            if let Some(session) = active.as_ref().filter(|_| is_active) {
                let live = bounded_elapsed(session.started_at, now, max_elapsed).unwrap_or(0);
                if live > 0 {
                    total_seconds = total_seconds.saturating_add(live);
                    let bucket = current_phase.as_deref().unwrap_or(UNPHASED_BUCKET);
                    let slot = phases.entry(bucket.to_string()).or_insert(0);
                    *slot = slot.saturating_add(live);
                }
            }

            TicketRow {
                ticket_id: ticket_id.clone(),
                title: state.ticket_titles.get(ticket_id).cloned(),
                total_seconds,
                phases,
                current_phase,
                active: is_active,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.total_seconds
            .cmp(&a.total_seconds)
            .then_with(|| a.ticket_id.cmp(&b.ticket_id))
    });

    TimerReport {
        generated_at: now,
        active,
        rows,
    }
}

/// The row for one ticket, including tickets with a cached title or phase but
/// no recorded time yet.
pub fn ticket_row(
    state: &TimerState,
    ticket_id: &str,
    now: DateTime<Utc>,
    max_elapsed: Duration,
) -> TicketRow {
    if let Some(row) = project(state, now, max_elapsed).row(ticket_id) {
        return row.clone();
    }
    TicketRow {
        ticket_id: ticket_id.to_string(),
        title: state.ticket_titles.get(ticket_id).cloned(),
        total_seconds: 0,
        phases: BTreeMap::new(),
        current_phase: state.current_phase(ticket_id).map(str::to_string),
        active: false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ticket details
// ─────────────────────────────────────────────────────────────────────────────

/// Whatever the page knows about a ticket. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketDetails {
    pub title: Option<String>,
    pub owner: Option<String>,
    pub cda: Option<String>,
    pub status: Option<String>,
}

/// Looks up ticket details outside the timer state (the board page).
pub trait TicketInfoSource: Send + Sync {
    fn details(&self, ticket_id: &str) -> Option<TicketDetails>;
}

/// Source that knows nothing; every field falls back to its placeholder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTicketInfo;

impl TicketInfoSource for NoTicketInfo {
    fn details(&self, _ticket_id: &str) -> Option<TicketDetails> {
        None
    }
}

impl TicketInfoSource for BTreeMap<String, TicketDetails> {
    fn details(&self, ticket_id: &str) -> Option<TicketDetails> {
        self.get(ticket_id).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketInfo {
    pub ticket_id: String,
    pub title: String,
    pub owner: String,
    pub cda: String,
    pub status: String,
}

pub fn ticket_info(row: &TicketRow, source: &dyn TicketInfoSource) -> TicketInfo {
    let details = source.details(&row.ticket_id).unwrap_or_default();
    let non_blank = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    TicketInfo {
        ticket_id: row.ticket_id.clone(),
        title: non_blank(details.title).unwrap_or_else(|| row.display_title()),
        owner: non_blank(details.owner).unwrap_or_else(|| UNKNOWN_OWNER.to_string()),
        cda: non_blank(details.cda).unwrap_or_else(|| UNKNOWN_CDA.to_string()),
        status: non_blank(details.status)
            .or_else(|| row.current_phase.clone())
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Known phases in board order, then every other phase that holds time,
/// alphabetically. The unphased bucket sorts with the "other" phases.
pub fn phase_columns(report: &TimerReport, known: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = known.to_vec();
    let mut extra: Vec<String> = report
        .rows
        .iter()
        .flat_map(|row| row.phases.keys())
        .filter(|phase| !known.contains(phase))
        .cloned()
        .collect();
    extra.sort();
    extra.dedup();
    columns.extend(extra);
    columns
}

pub fn render_csv(report: &TimerReport, source: &dyn TicketInfoSource, known: &[String]) -> String {
    let columns = phase_columns(report, known);

    let mut csv = String::from(CSV_BASE_HEADER);
    for phase in &columns {
        csv.push_str(",Tempo em ");
        csv.push_str(&phase.replace(',', " "));
    }
    csv.push('\n');

    for row in &report.rows {
        let info = ticket_info(row, source);
        csv.push_str(&row.ticket_id.replace(',', " "));
        for field in [&info.title, &info.owner, &info.cda, &info.status] {
            csv.push(',');
            csv.push_str(&quote_field(field));
        }
        csv.push(',');
        csv.push_str(&format_hms(row.total_seconds));
        for phase in &columns {
            csv.push(',');
            csv.push_str(&format_hms(row.phases.get(phase).copied().unwrap_or(0)));
        }
        csv.push('\n');
    }

    csv
}

/// Quotes a text cell. Commas become spaces, embedded quotes are doubled.
fn quote_field(value: &str) -> String {
    format!("\"{}\"", value.replace(',', " ").replace('"', "\"\""))
}

/// Plain-text summary of one ticket, as copied from the popup.
pub fn render_ticket_summary(row: &TicketRow, known: &[String]) -> String {
    let mut summary = format!(
        "Tempo Gasto no Ticket: {}\nID: {}\nFases: ",
        row.display_title(),
        row.ticket_id
    );

    let mut ordered: Vec<&String> = known.iter().collect();
    let mut extra: Vec<&String> = row.phases.keys().filter(|p| !known.contains(p)).collect();
    extra.sort();
    ordered.extend(extra);

    let mut any_phase = false;
    for phase in ordered {
        let seconds = row.phases.get(phase).copied().unwrap_or(0);
        if seconds > 0 {
            any_phase = true;
            summary.push_str(&format!("{}: {} ", phase, format_hours_minutes(seconds)));
        }
    }
    if !any_phase {
        summary.push_str("Nenhuma fase com tempo registrado. ");
    }

    summary.push_str(&format!(
        "\nTempo Total: {}",
        format_hours_minutes(row.total_seconds)
    ));
    summary
}

/// `hh:mm:ss`; hours grow past two digits when needed.
pub fn format_hms(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// `2h 30min`, `2h`, `45min`, or `menos de 1min` under a minute.
pub fn format_hours_minutes(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    match (hours, minutes) {
        (0, 0) => "menos de 1min".to_string(),
        (0, m) => format!("{}min", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}min", h, m),
    }
}

pub fn export_file_name(date: NaiveDate) -> String {
    format!("timeMyTicket-{}.csv", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn known() -> Vec<String> {
        vec!["Novo".to_string(), "Backlog".to_string()]
    }

    fn sample_state() -> TimerState {
        let mut state = TimerState::default();
        state.credit("101", "Novo", 120);
        state.credit("202", "Backlog", 30);
        state.credit("202", "Zeta", 600);
        state.current_phases.insert("101".to_string(), "Novo".to_string());
        state
            .ticket_titles
            .insert("101".to_string(), "Impressora, 3º andar".to_string());
        state
    }

    #[test]
    fn rows_sorted_by_total_then_id() {
        let mut state = sample_state();
        state.ticket_timers.insert("303".to_string(), 630);
        let report = project(&state, at(0), Duration::days(30));
        let ids: Vec<&str> = report.rows.iter().map(|r| r.ticket_id.as_str()).collect();
        assert_eq!(ids, vec!["202", "303", "101"]);
    }

    #[test]
    fn live_elapsed_folds_into_total_and_current_phase() {
        let mut state = sample_state();
        state.set_active_session(Some(ActiveSession {
            ticket_id: "101".to_string(),
            started_at: at(0),
        }));

        let report = project(&state, at(45), Duration::days(30));
        let row = report.row("101").expect("row");
        assert!(row.active);
        assert_eq!(row.total_seconds, 165);
        assert_eq!(row.phases["Novo"], 165);
        // stored state is untouched
        assert_eq!(state.total_seconds("101"), 120);
    }

    #[test]
    fn live_elapsed_without_phase_uses_unphased_bucket() {
        let mut state = TimerState::default();
        state.set_active_session(Some(ActiveSession {
            ticket_id: "9".to_string(),
            started_at: at(0),
        }));
        let report = project(&state, at(10), Duration::days(30));
        let row = report.row("9").expect("row for running ticket");
        assert_eq!(row.total_seconds, 10);
        assert_eq!(row.phases[UNPHASED_BUCKET], 10);
    }

    #[test]
    fn live_elapsed_over_threshold_is_ignored() {
        let mut state = sample_state();
        state.set_active_session(Some(ActiveSession {
            ticket_id: "101".to_string(),
            started_at: at(0),
        }));
        let report = project(&state, at(0) + Duration::days(40), Duration::days(30));
        assert_eq!(report.row("101").expect("row").total_seconds, 120);
    }

    #[test]
    fn csv_has_known_then_extra_phase_columns() {
        let report = project(&sample_state(), at(0), Duration::days(30));
        let csv = render_csv(&report, &NoTicketInfo, &known());
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("ID do Ticket,Título,Proprietário,CDA Responsável,Status,Tempo Total,Tempo em Novo,Tempo em Backlog,Tempo em Zeta")
        );
        assert_eq!(
            lines.next(),
            Some("202,\"Ticket #202\",\"Desconhecido\",\"Não informado\",\"Desconhecido\",00:10:30,00:00:00,00:00:30,00:10:00")
        );
        assert_eq!(
            lines.next(),
            Some("101,\"Impressora  3º andar\",\"Desconhecido\",\"Não informado\",\"Novo\",00:02:00,00:02:00,00:00:00,00:00:00")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn details_source_overrides_placeholders() {
        let report = project(&sample_state(), at(0), Duration::days(30));
        let mut details = BTreeMap::new();
        details.insert(
            "101".to_string(),
            TicketDetails {
                owner: Some("Ana, Souza".to_string()),
                status: Some("  ".to_string()),
                ..TicketDetails::default()
            },
        );
        let info = ticket_info(report.row("101").expect("row"), &details);
        assert_eq!(info.owner, "Ana, Souza");
        assert_eq!(info.status, "Novo");
        assert_eq!(info.title, "Impressora, 3º andar");

        let csv = render_csv(&report, &details, &known());
        assert!(csv.contains("\"Ana  Souza\""));
    }

    #[test]
    fn summary_lists_phases_with_time() {
        let report = project(&sample_state(), at(0), Duration::days(30));
        let summary = render_ticket_summary(report.row("202").expect("row"), &known());
        assert_eq!(
            summary,
            "Tempo Gasto no Ticket: Ticket #202\nID: 202\nFases: Backlog: menos de 1min Zeta: 10min \nTempo Total: 10min"
        );

        let empty = TicketRow {
            ticket_id: "5".to_string(),
            title: None,
            total_seconds: 0,
            phases: BTreeMap::new(),
            current_phase: None,
            active: false,
        };
        assert!(render_ticket_summary(&empty, &known()).contains("Nenhuma fase com tempo registrado."));
    }

    #[test]
    fn ticket_row_for_untimed_ticket_keeps_cached_details() {
        let mut state = sample_state();
        state.current_phases.insert("404".to_string(), "Triagem".to_string());
        state.ticket_titles.insert("404".to_string(), "Toner".to_string());

        let row = ticket_row(&state, "404", at(0), Duration::days(30));
        assert_eq!(row.total_seconds, 0);
        assert_eq!(row.current_phase.as_deref(), Some("Triagem"));
        assert_eq!(row.display_title(), "Toner");

        let timed = ticket_row(&state, "101", at(0), Duration::days(30));
        assert_eq!(timed.total_seconds, 120);
    }

    #[test]
    fn duration_formats() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(3_725), "01:02:05");
        assert_eq!(format_hms(360_000), "100:00:00");
        assert_eq!(format_hours_minutes(59), "menos de 1min");
        assert_eq!(format_hours_minutes(60), "1min");
        assert_eq!(format_hours_minutes(7_200), "2h");
        assert_eq!(format_hours_minutes(9_000), "2h 30min");
    }

    #[test]
    fn export_name_uses_iso_date() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        assert_eq!(export_file_name(date), "timeMyTicket-2026-03-02.csv");
    }
}
