//! IPC protocol types and validation for the ticket timer daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TICKET_ID_LEN: usize = 128;
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_SHUTTING_DOWN: &str = "shutting_down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetTimerData,
    StartTimer,
    ToggleTimer,
    PauseTimer,
    UpdateTicketTime,
    ResetTicketTimer,
    ResetAllTimers,
    AddTimeToPhase,
    UpdateTicketPhase,
    GetTicketInfo,
    GetReport,
    ExportTimerReport,
    SaveReportData,
    SyncData,
    Watch,
    TabClosed,
}

impl Method {
    /// Methods that may change the durable state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Method::StartTimer
                | Method::ToggleTimer
                | Method::PauseTimer
                | Method::UpdateTicketTime
                | Method::ResetTicketTimer
                | Method::ResetAllTimers
                | Method::AddTimeToPhase
                | Method::UpdateTicketPhase
                | Method::TabClosed
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    /// Identifies the sending tab/process so refresh pushes skip it.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            client_id: None,
            params,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Server-initiated line sent on `watch` connections. Carries no data: the
/// receiver re-reads whatever it displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Push {
    RefreshTimers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketParams {
    pub ticket_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketTimeParams {
    pub ticket_id: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseTimeParams {
    pub ticket_id: String,
    #[serde(default)]
    pub phase: Option<String>,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketPhaseParams {
    pub ticket_id: String,
    pub phase: String,
    #[serde(default)]
    pub observed_at: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl TicketPhaseParams {
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.observed_at
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveReportParams {
    pub csv_content: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

pub fn parse_ticket(params: Option<Value>) -> Result<TicketParams, ErrorInfo> {
    let parsed: TicketParams = parse_params(params, "ticket_id is required")?;
    require_ticket_id(&parsed.ticket_id)?;
    Ok(parsed)
}

pub fn parse_ticket_time(params: Option<Value>) -> Result<TicketTimeParams, ErrorInfo> {
    let parsed: TicketTimeParams = parse_params(params, "ticket_id and seconds are required")?;
    require_ticket_id(&parsed.ticket_id)?;
    if parsed.seconds < 0 {
        return Err(ErrorInfo::new(
            "invalid_params",
            "seconds must not be negative",
        ));
    }
    Ok(parsed)
}

/// Non-positive durations are passed through: rejecting them is the engine's
/// validation rule, reported as `validation_error`.
pub fn parse_phase_time(params: Option<Value>) -> Result<PhaseTimeParams, ErrorInfo> {
    let parsed: PhaseTimeParams = parse_params(params, "ticket_id and seconds are required")?;
    require_ticket_id(&parsed.ticket_id)?;
    Ok(parsed)
}

pub fn parse_ticket_phase(params: Option<Value>) -> Result<TicketPhaseParams, ErrorInfo> {
    let parsed: TicketPhaseParams = parse_params(params, "ticket_id and phase are required")?;
    require_ticket_id(&parsed.ticket_id)?;
    require_string(&parsed.phase, "phase")?;
    if parsed.observed_at.is_some() && parsed.observed_at().is_none() {
        return Err(ErrorInfo::new(
            "invalid_timestamp",
            "observed_at must be RFC3339",
        ));
    }
    Ok(parsed)
}

pub fn parse_save_report(params: Option<Value>) -> Result<SaveReportParams, ErrorInfo> {
    let parsed: SaveReportParams = parse_params(params, "csv_content is required")?;
    require_string(&parsed.csv_content, "csv_content")?;
    Ok(parsed)
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
    missing: &str,
) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", missing))?;
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("params are invalid: {}", err),
        )
    })
}

fn require_ticket_id(ticket_id: &str) -> Result<(), ErrorInfo> {
    require_string(ticket_id, "ticket_id")?;
    if ticket_id.len() > MAX_TICKET_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_ticket_id",
            "ticket_id must be 128 characters or fewer",
        ));
    }
    Ok(())
}

fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ticket_params() {
        let parsed = parse_ticket(Some(json!({"ticket_id": "101"}))).expect("params");
        assert_eq!(parsed.ticket_id, "101");
    }

    #[test]
    fn rejects_missing_params() {
        let err = parse_ticket(None).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_blank_ticket_id() {
        let err = parse_ticket(Some(json!({"ticket_id": "  "}))).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_long_ticket_id() {
        let err = parse_ticket(Some(json!({"ticket_id": "a".repeat(256)}))).unwrap_err();
        assert_eq!(err.code, "invalid_ticket_id");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_ticket(Some(json!({"ticket_id": "1", "extra": true}))).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn ticket_time_rejects_negative_seconds() {
        let err =
            parse_ticket_time(Some(json!({"ticket_id": "1", "seconds": -5}))).unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn phase_time_keeps_non_positive_for_engine_validation() {
        let parsed =
            parse_phase_time(Some(json!({"ticket_id": "1", "phase": "Novo", "seconds": 0})))
                .expect("params");
        assert_eq!(parsed.seconds, 0);
        assert_eq!(parsed.phase.as_deref(), Some("Novo"));
    }

    #[test]
    fn ticket_phase_validates_timestamp() {
        let err = parse_ticket_phase(Some(json!({
            "ticket_id": "1",
            "phase": "Novo",
            "observed_at": "yesterday"
        })))
        .unwrap_err();
        assert_eq!(err.code, "invalid_timestamp");

        let parsed = parse_ticket_phase(Some(json!({
            "ticket_id": "1",
            "phase": "Novo",
            "observed_at": "2026-01-30T12:00:00Z"
        })))
        .expect("params");
        assert!(parsed.observed_at().is_some());
    }

    #[test]
    fn method_names_are_snake_case() {
        let encoded = serde_json::to_string(&Method::AddTimeToPhase).expect("encode");
        assert_eq!(encoded, "\"add_time_to_phase\"");
        assert!(Method::PauseTimer.is_mutating());
        assert!(!Method::GetReport.is_mutating());
    }

    #[test]
    fn push_line_shape() {
        let encoded = serde_json::to_string(&Push::RefreshTimers).expect("encode");
        assert_eq!(encoded, "\"refresh_timers\"");
    }
}
