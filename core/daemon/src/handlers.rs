//! Request dispatch: one protocol method maps onto one engine operation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use ticket_timer_protocol::{
    parse_phase_time, parse_save_report, parse_ticket, parse_ticket_phase, parse_ticket_time,
    Method, Request, Response, ERROR_SHUTTING_DOWN, PROTOCOL_VERSION,
};
use timer_core::report::{
    export_file_name, render_csv, render_ticket_summary, ticket_info, ticket_row, NoTicketInfo,
};
use timer_core::{
    on_teardown, OriginId, PhaseFact, SyncHub, TeardownReason, TimeEngine, TimerConfig,
    TimerError,
};

pub struct DaemonContext {
    pub engine: TimeEngine,
    pub hub: SyncHub,
    pub known_phases: Vec<String>,
    pub exports_dir: PathBuf,
    pub teardown_timeout: Duration,
    draining: AtomicBool,
}

impl DaemonContext {
    pub fn new(engine: TimeEngine, hub: SyncHub, config: &TimerConfig, exports_dir: PathBuf) -> Self {
        Self {
            engine,
            hub,
            known_phases: config.phases.known.clone(),
            exports_dir: config.export.dir.clone().unwrap_or(exports_dir),
            teardown_timeout: config.lifecycle.teardown_timeout(),
            draining: AtomicBool::new(false),
        }
    }

    /// Stops accepting state changes. Reads keep working so clients can
    /// fetch the final totals while the daemon pauses and exits.
    pub fn begin_shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// The engine as seen by one client: its changes are not echoed back to
    /// that client's own `watch` connection.
    fn engine_for(&self, request: &Request) -> TimeEngine {
        match request.client_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(client_id) => self.engine.for_origin(OriginId::from(client_id)),
            None => self.engine.clone(),
        }
    }
}

pub async fn handle_request(request: Request, ctx: &DaemonContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    if request.method.is_mutating() && ctx.is_draining() {
        debug!(method = ?request.method, "Rejecting state change during shutdown");
        return Response::error(request.id, ERROR_SHUTTING_DOWN, "daemon is shutting down");
    }

    let engine = ctx.engine_for(&request);
    let today = engine.now().date_naive();
    let id = request.id;
    let params = request.params;

    match request.method {
        Method::GetHealth => Response::ok(
            id,
            json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            }),
        ),
        Method::GetTimerData => respond(id, "timer data", engine.timer_data().await),
        Method::StartTimer => match parse_ticket(params) {
            Ok(parsed) => respond(id, "start outcome", engine.start(&parsed.ticket_id).await),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ToggleTimer => match parse_ticket(params) {
            Ok(parsed) => respond(id, "toggle outcome", engine.toggle(&parsed.ticket_id).await),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::PauseTimer => respond(id, "pause outcome", engine.pause().await),
        Method::UpdateTicketTime => match parse_ticket_time(params) {
            Ok(parsed) => {
                let result = engine
                    .set_ticket_total(&parsed.ticket_id, parsed.seconds as u64)
                    .await
                    .map(|total| json!({ "ticket_id": parsed.ticket_id, "total_seconds": total }));
                respond(id, "ticket total", result)
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ResetTicketTimer => match parse_ticket(params) {
            Ok(parsed) => respond(id, "reset outcome", engine.reset_ticket(&parsed.ticket_id).await),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ResetAllTimers => {
            let result = engine.reset_all().await.map(|cleared| json!({ "cleared": cleared }));
            respond(id, "reset summary", result)
        }
        Method::AddTimeToPhase => match parse_phase_time(params) {
            Ok(parsed) => {
                let result = engine
                    .add_manual_time(&parsed.ticket_id, parsed.phase.as_deref(), parsed.seconds)
                    .await;
                respond(id, "credit", result)
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::UpdateTicketPhase => match parse_ticket_phase(params) {
            Ok(parsed) => {
                let fact = PhaseFact {
                    observed_at: parsed.observed_at().unwrap_or_else(|| engine.now()),
                    ticket_id: parsed.ticket_id,
                    phase: parsed.phase,
                    title: parsed.title,
                };
                respond(id, "phase outcome", engine.observe_phase(&fact).await)
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetTicketInfo => match parse_ticket(params) {
            Ok(parsed) => {
                let result = engine.timer_data().await.map(|state| {
                    let row = ticket_row(
                        &state,
                        &parsed.ticket_id,
                        engine.now(),
                        engine.config().max_elapsed(),
                    );
                    json!({
                        "info": ticket_info(&row, &NoTicketInfo),
                        "summary": render_ticket_summary(&row, &ctx.known_phases),
                        "row": row,
                    })
                });
                respond(id, "ticket info", result)
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetReport => respond(id, "report", engine.report().await),
        Method::ExportTimerReport => {
            let result = engine.report().await.map(|report| {
                json!({
                    "file_name": export_file_name(today),
                    "rows": report.rows.len(),
                    "csv_content": render_csv(&report, &NoTicketInfo, &ctx.known_phases),
                })
            });
            respond(id, "export", result)
        }
        Method::SaveReportData => match parse_save_report(params) {
            Ok(parsed) => {
                let file_name = export_target_name(parsed.file_name.as_deref(), today);
                match save_report(&ctx.exports_dir, &file_name, parsed.csv_content).await {
                    Ok(path) => {
                        info!(path = %path.display(), "Report saved");
                        Response::ok(id, json!({ "path": path.to_string_lossy() }))
                    }
                    Err(err) => {
                        warn!(error = %err, "Failed to save report");
                        Response::error(id, "export_error", err)
                    }
                }
            }
            Err(err) => Response::error_with_info(id, err),
        },
        Method::SyncData => {
            engine.broadcast_refresh();
            Response::ok(id, json!({ "broadcast": true }))
        }
        Method::Watch => Response::ok(id, json!({ "watching": true })),
        Method::TabClosed => {
            let outcome = on_teardown(&engine, TeardownReason::TabClosed, ctx.teardown_timeout).await;
            Response::ok(
                id,
                json!({ "paused": outcome.is_some(), "outcome": outcome }),
            )
        }
    }
}

fn respond<T: Serialize>(id: Option<String>, what: &str, result: Result<T, TimerError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize {}: {}", what, err),
            ),
        },
        Err(err) => {
            if err.is_validation() {
                debug!(error = %err, "Request rejected");
            } else {
                warn!(error = %err, "Request failed");
            }
            Response::error(id, err.code(), err.to_string())
        }
    }
}

/// Keeps only the final path component of a client-supplied name.
fn export_target_name(requested: Option<&str>, today: NaiveDate) -> String {
    requested
        .and_then(|name| Path::new(name.trim()).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| export_file_name(today))
}

async fn save_report(dir: &Path, file_name: &str, content: String) -> Result<PathBuf, String> {
    let path = dir.join(file_name);
    let target = path.clone();
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        fs_err::create_dir_all(&dir)
            .map_err(|err| format!("Failed to create export directory: {}", err))?;
        fs_err::write(&target, content).map_err(|err| format!("Failed to write report: {}", err))
    })
    .await
    .map_err(|err| format!("Report write task failed: {}", err))??;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::store::SqliteStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use timer_core::{ManualClock, MemoryStore, SyncHub};

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: DaemonContext,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("state.db")).expect("db");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 10, 23, 30, 0).unwrap());
        let hub = SyncHub::default();
        let config = TimerConfig::default();
        let engine = TimeEngine::new(
            Arc::new(SqliteStore::new(db)),
            Arc::new(clock.clone()),
            config.engine.clone(),
        )
        .with_notifier(hub.notifier(OriginId::from("daemon")));
        let ctx = DaemonContext::new(engine, hub, &config, dir.path().join("exports"));
        Fixture {
            _dir: dir,
            ctx,
            clock,
        }
    }

    fn request(method: Method, params: Option<serde_json::Value>) -> Request {
        let mut request = Request::new(method, params);
        request.id = Some("t".to_string());
        request
    }

    async fn call(fx: &Fixture, method: Method, params: Option<serde_json::Value>) -> Response {
        handle_request(request(method, params), &fx.ctx).await
    }

    #[tokio::test]
    async fn rejects_protocol_mismatch() {
        let fx = fixture();
        let mut req = request(Method::GetHealth, None);
        req.protocol_version = 99;
        let response = handle_request(req, &fx.ctx).await;
        assert!(!response.ok);
        assert_eq!(response.error.expect("error").code, "protocol_mismatch");
    }

    #[tokio::test]
    async fn start_pause_and_read_back() {
        let fx = fixture();
        let phase = call(
            &fx,
            Method::UpdateTicketPhase,
            Some(json!({"ticket_id": "101", "phase": "Novo", "title": "Impressora"})),
        )
        .await;
        assert!(phase.ok);

        let started = call(&fx, Method::StartTimer, Some(json!({"ticket_id": "101"}))).await;
        assert!(started.ok);
        assert_eq!(started.data.expect("data")["outcome"], "started");

        fx.clock.advance_secs(120);
        let paused = call(&fx, Method::PauseTimer, None).await;
        assert_eq!(paused.data.expect("data")["credit"]["seconds"], 120);

        let data = call(&fx, Method::GetTimerData, None).await.data.expect("data");
        assert_eq!(data["ticketTimers"]["101"], 120);
        assert_eq!(data["phaseTimers"]["101"]["Novo"], 120);
        assert_eq!(data["ticketTitles"]["101"], "Impressora");
    }

    #[tokio::test]
    async fn validation_failures_use_engine_codes() {
        let fx = fixture();
        let response = call(
            &fx,
            Method::AddTimeToPhase,
            Some(json!({"ticket_id": "5", "phase": "Novo", "seconds": 0})),
        )
        .await;
        assert_eq!(response.error.expect("error").code, "validation_error");

        let response = call(&fx, Method::StartTimer, Some(json!({"ticket_id": " "}))).await;
        assert_eq!(response.error.expect("error").code, "invalid_ticket_id");
    }

    #[tokio::test]
    async fn export_and_save_report() {
        let fx = fixture();
        call(
            &fx,
            Method::AddTimeToPhase,
            Some(json!({"ticket_id": "7", "phase": "Backlog", "seconds": 90})),
        )
        .await;

        let export = call(&fx, Method::ExportTimerReport, None).await.data.expect("data");
        let csv = export["csv_content"].as_str().expect("csv").to_string();
        assert!(csv.starts_with("ID do Ticket,"));
        assert!(export["file_name"].as_str().expect("name").starts_with("timeMyTicket-"));

        let saved = call(
            &fx,
            Method::SaveReportData,
            Some(json!({"csv_content": csv, "file_name": "../../escape.csv"})),
        )
        .await;
        let path = PathBuf::from(saved.data.expect("data")["path"].as_str().expect("path"));
        assert_eq!(path, fx.ctx.exports_dir.join("escape.csv"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), csv);
    }

    #[tokio::test]
    async fn ticket_info_uses_placeholders() {
        let fx = fixture();
        let data = call(&fx, Method::GetTicketInfo, Some(json!({"ticket_id": "88"})))
            .await
            .data
            .expect("data");
        assert_eq!(data["info"]["title"], "Ticket #88");
        assert_eq!(data["info"]["owner"], "Desconhecido");
        assert_eq!(data["info"]["cda"], "Não informado");
        assert!(data["summary"].as_str().expect("summary").contains("ID: 88"));
    }

    #[tokio::test]
    async fn tab_closed_pauses_running_ticket() {
        let fx = fixture();
        call(&fx, Method::StartTimer, Some(json!({"ticket_id": "9"}))).await;
        fx.clock.advance_secs(4);
        let data = call(&fx, Method::TabClosed, None).await.data.expect("data");
        assert_eq!(data["paused"], true);
        assert_eq!(data["outcome"]["credit"]["seconds"], 4);
    }

    #[tokio::test]
    async fn client_changes_skip_their_own_watchers() {
        let fx = fixture();
        let mut own = fx.ctx.hub.subscribe(OriginId::from("tab-a"));
        let mut other = fx.ctx.hub.subscribe(OriginId::from("tab-b"));

        let req = request(Method::StartTimer, Some(json!({"ticket_id": "1"}))).with_client_id("tab-a");
        assert!(handle_request(req, &fx.ctx).await.ok);

        assert_eq!(other.recv().await.expect("signal").origin, OriginId::from("tab-a"));
        let waited = tokio::time::timeout(Duration::from_millis(20), own.recv()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn export_name_is_reduced_to_file_name() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        assert_eq!(export_target_name(Some("/etc/passwd"), today), "passwd");
        assert_eq!(export_target_name(Some("report.csv"), today), "report.csv");
        assert_eq!(export_target_name(Some(""), today), "timeMyTicket-2026-02-10.csv");
        assert_eq!(export_target_name(Some(".."), today), "timeMyTicket-2026-02-10.csv");
        assert_eq!(export_target_name(None, today), "timeMyTicket-2026-02-10.csv");
    }

    #[tokio::test]
    async fn export_names_follow_the_engine_clock() {
        let fx = fixture();
        let export = call(&fx, Method::ExportTimerReport, None).await.data.expect("data");
        assert_eq!(export["file_name"], "timeMyTicket-2026-02-10.csv");

        fx.clock.advance_secs(3600);
        let export = call(&fx, Method::ExportTimerReport, None).await.data.expect("data");
        assert_eq!(export["file_name"], "timeMyTicket-2026-02-11.csv");

        let saved = call(&fx, Method::SaveReportData, Some(json!({"csv_content": "x"}))).await;
        let path = PathBuf::from(saved.data.expect("data")["path"].as_str().expect("path"));
        assert_eq!(path, fx.ctx.exports_dir.join("timeMyTicket-2026-02-11.csv"));
    }

    #[tokio::test]
    async fn store_write_failures_reach_the_client_as_store_errors() {
        let store = Arc::new(MemoryStore::new());
        let config = TimerConfig::default();
        let engine = TimeEngine::new(
            store.clone(),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap())),
            config.engine.clone(),
        );
        let ctx =
            DaemonContext::new(engine, SyncHub::default(), &config, PathBuf::from("exports"));

        store.fail_writes(true);
        let response = handle_request(
            request(Method::StartTimer, Some(json!({"ticket_id": "1"}))),
            &ctx,
        )
        .await;
        assert_eq!(response.error.expect("error").code, "store_error");
        assert!(store.dump().await.is_empty());

        store.fail_writes(false);
        let response = handle_request(
            request(Method::StartTimer, Some(json!({"ticket_id": "1"}))),
            &ctx,
        )
        .await;
        assert!(response.ok);
    }

    #[tokio::test]
    async fn draining_daemon_refuses_changes_but_serves_reads() {
        let fx = fixture();
        call(&fx, Method::StartTimer, Some(json!({"ticket_id": "3"}))).await;
        fx.ctx.begin_shutdown();

        let started = call(&fx, Method::StartTimer, Some(json!({"ticket_id": "4"}))).await;
        assert_eq!(started.error.expect("error").code, ERROR_SHUTTING_DOWN);
        let added = call(
            &fx,
            Method::AddTimeToPhase,
            Some(json!({"ticket_id": "4", "seconds": 30})),
        )
        .await;
        assert_eq!(added.error.expect("error").code, ERROR_SHUTTING_DOWN);

        let data = call(&fx, Method::GetTimerData, None).await.data.expect("data");
        assert_eq!(data["activeTicket"], "3");
        assert!(call(&fx, Method::GetReport, None).await.ok);
        assert!(call(&fx, Method::GetHealth, None).await.ok);
    }
}
