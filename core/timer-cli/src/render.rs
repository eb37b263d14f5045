//! Human-readable output for daemon replies.

use serde_json::Value;
use timer_core::report::format_hms;
use timer_core::TimerReport;

pub fn hms(seconds: &Value) -> String {
    format_hms(seconds.as_u64().unwrap_or(0))
}

pub fn start_outcome(data: &Value) -> String {
    let ticket = data["session"]["ticket_id"].as_str().unwrap_or("?");
    let mut line = match data["outcome"].as_str() {
        Some("already_running") => format!("ticket {} is already running", ticket),
        _ => format!("started ticket {}", ticket),
    };
    if data["paused"].is_object() {
        line.push_str(&format!(" (paused {})", credit(&data["paused"])));
    }
    line
}

pub fn pause_outcome(data: &Value) -> String {
    match data["outcome"].as_str() {
        Some("paused") => format!("paused {}", credit(&data["credit"])),
        _ => "no timer was running".to_string(),
    }
}

pub fn manual_time(data: &Value) -> String {
    format!("added {}", credit(data))
}

fn credit(credit: &Value) -> String {
    let ticket = credit["ticket_id"].as_str().unwrap_or("?");
    let phase = credit["phase"].as_str().unwrap_or("?");
    if credit["discarded"].as_bool().unwrap_or(false) {
        return format!("ticket {} (stale interval discarded)", ticket);
    }
    format!("ticket {}: {} in {}", ticket, hms(&credit["seconds"]), phase)
}

/// One line per ticket: marker, id, total, current phase and title.
pub fn status_table(report: &TimerReport) -> String {
    if report.rows.is_empty() {
        return "no tracked tickets".to_string();
    }

    let id_width = report
        .rows
        .iter()
        .map(|row| row.ticket_id.len())
        .max()
        .unwrap_or(0)
        .max("ID".len());

    let mut lines = vec![format!("  {:<id_width$}  {:>8}  PHASE / TITLE", "ID", "TOTAL")];
    for row in &report.rows {
        let marker = if row.active { '>' } else { ' ' };
        let phase = row.current_phase.as_deref().unwrap_or("-");
        lines.push(format!(
            "{} {:<id_width$}  {:>8}  {} / {}",
            marker,
            row.ticket_id,
            format_hms(row.total_seconds),
            phase,
            row.display_title()
        ));
    }
    lines.join("\n")
}
