//! ticket-timer: command-line client for the ticket timer daemon.
//!
//! Each subcommand maps to one daemon method. Output is human-readable by
//! default; `--json` prints the raw response payload instead.

mod daemon_client;
mod logging;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use ticket_timer_protocol::Method;
use timer_core::TimerReport;

use daemon_client::{ClientError, DaemonClient};

#[derive(Parser)]
#[command(name = "ticket-timer")]
#[command(about = "Per-ticket, per-phase time tracking")]
#[command(version)]
struct Cli {
    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    /// Identity used to skip this client's own refresh pushes
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Daemon socket path (defaults to the data directory)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the daemon is up
    Health,

    /// Start the timer for a ticket, pausing any other running ticket
    Start { ticket_id: String },

    /// Pause the running timer
    Pause,

    /// Pause the ticket if it is running, otherwise start it
    Toggle { ticket_id: String },

    /// Record the board column a ticket was observed in
    Phase {
        ticket_id: String,
        phase: String,
        /// Ticket title seen alongside the phase
        #[arg(long)]
        title: Option<String>,
        /// RFC3339 observation time (defaults to now)
        #[arg(long)]
        observed_at: Option<String>,
    },

    /// Clear one ticket's recorded time
    Reset { ticket_id: String },

    /// Clear every ticket's recorded time
    ResetAll {
        /// Required; this cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Add manual time to a ticket's phase
    Add {
        ticket_id: String,
        /// Seconds to add (must be positive)
        seconds: i64,
        /// Phase to credit (defaults to the "Sem fase" bucket)
        #[arg(long)]
        phase: Option<String>,
    },

    /// Overwrite a ticket's total
    Set { ticket_id: String, seconds: i64 },

    /// Show every tracked ticket with live totals
    Status,

    /// Show one ticket's summary
    Info { ticket_id: String },

    /// Build the CSV report
    Export {
        /// Write the CSV here instead of stdout
        #[arg(long, conflicts_with = "save")]
        out: Option<PathBuf>,
        /// Ask the daemon to save it in its exports directory
        #[arg(long)]
        save: bool,
    },

    /// Ask other clients to re-read timer state
    Sync,

    /// Print a line each time another client changes timer state
    Watch {
        /// Stop after this many refreshes
        #[arg(long)]
        count: Option<u64>,
    },

    /// Pause the running timer because this client is going away
    CloseTab,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "ticket-timer command failed");
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let socket = match cli.socket {
        Some(socket) => socket,
        None => daemon_client::socket_path()?,
    };
    let client_id = cli
        .client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("cli-{}", ulid::Ulid::new()));
    let client = DaemonClient::new(socket, client_id);
    let json_output = cli.json;

    let call = |method: Method, params: Option<Value>| -> Result<Value, String> {
        client.call(method, params).map_err(describe)
    };
    let print = |data: &Value, human: String| {
        if json_output {
            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
        } else {
            println!("{}", human);
        }
    };

    match cli.command {
        Commands::Health => {
            let data = call(Method::GetHealth, None)?;
            let human = format!(
                "daemon {} (pid {})",
                data["status"].as_str().unwrap_or("unknown"),
                data["pid"]
            );
            print(&data, human);
        }
        Commands::Start { ticket_id } => {
            let data = call(Method::StartTimer, Some(json!({ "ticket_id": ticket_id })))?;
            print(&data, render::start_outcome(&data));
        }
        Commands::Pause => {
            let data = call(Method::PauseTimer, None)?;
            print(&data, render::pause_outcome(&data));
        }
        Commands::Toggle { ticket_id } => {
            let data = call(Method::ToggleTimer, Some(json!({ "ticket_id": ticket_id })))?;
            let human = match data["outcome"].as_str() {
                Some("started") => render::start_outcome(&data["start"]),
                _ => render::pause_outcome(&data),
            };
            print(&data, human);
        }
        Commands::Phase {
            ticket_id,
            phase,
            title,
            observed_at,
        } => {
            let mut params = json!({ "ticket_id": ticket_id, "phase": phase });
            if let Some(title) = title {
                params["title"] = json!(title);
            }
            if let Some(observed_at) = observed_at {
                params["observed_at"] = json!(observed_at);
            }
            let data = call(Method::UpdateTicketPhase, Some(params))?;
            let human = format!(
                "ticket {}: {}",
                ticket_id,
                data["outcome"].as_str().unwrap_or("updated")
            );
            print(&data, human);
        }
        Commands::Reset { ticket_id } => {
            let data = call(Method::ResetTicketTimer, Some(json!({ "ticket_id": ticket_id })))?;
            print(&data, format!("ticket {} reset", ticket_id));
        }
        Commands::ResetAll { yes } => {
            if !yes {
                return Err("reset-all clears every ticket; pass --yes to confirm".to_string());
            }
            let data = call(Method::ResetAllTimers, None)?;
            let human = format!("{} tickets cleared", data["cleared"].as_u64().unwrap_or(0));
            print(&data, human);
        }
        Commands::Add {
            ticket_id,
            seconds,
            phase,
        } => {
            let data = call(
                Method::AddTimeToPhase,
                Some(json!({ "ticket_id": ticket_id, "phase": phase, "seconds": seconds })),
            )?;
            print(&data, render::manual_time(&data));
        }
        Commands::Set { ticket_id, seconds } => {
            let data = call(
                Method::UpdateTicketTime,
                Some(json!({ "ticket_id": ticket_id, "seconds": seconds })),
            )?;
            let human = format!(
                "ticket {} total set to {}",
                ticket_id,
                render::hms(&data["total_seconds"])
            );
            print(&data, human);
        }
        Commands::Status => {
            let data = call(Method::GetReport, None)?;
            let report: TimerReport = serde_json::from_value(data.clone())
                .map_err(|err| format!("Unexpected report payload: {}", err))?;
            print(&data, render::status_table(&report));
        }
        Commands::Info { ticket_id } => {
            let data = call(Method::GetTicketInfo, Some(json!({ "ticket_id": ticket_id })))?;
            let human = data["summary"].as_str().unwrap_or_default().to_string();
            print(&data, human);
        }
        Commands::Export { out, save } => {
            let data = call(Method::ExportTimerReport, None)?;
            let csv = data["csv_content"].as_str().unwrap_or_default().to_string();
            if save {
                let saved = call(
                    Method::SaveReportData,
                    Some(json!({ "csv_content": csv, "file_name": data["file_name"] })),
                )?;
                let human = format!("saved {}", saved["path"].as_str().unwrap_or_default());
                print(&saved, human);
            } else if let Some(out) = out {
                fs_err::write(&out, csv.as_bytes()).map_err(|err| err.to_string())?;
                print(&data, format!("wrote {}", out.display()));
            } else if json_output {
                print(&data, String::new());
            } else {
                print!("{}", csv);
            }
        }
        Commands::Sync => {
            let data = call(Method::SyncData, None)?;
            print(&data, "refresh broadcast".to_string());
        }
        Commands::Watch { count } => {
            eprintln!("watching as {}", client.client_id());
            let mut seen = 0u64;
            client
                .watch(|| {
                    seen += 1;
                    println!("{} refresh_timers", chrono::Local::now().format("%H:%M:%S"));
                    count.map_or(true, |limit| seen < limit)
                })
                .map_err(describe)?;
        }
        Commands::CloseTab => {
            let data = call(Method::TabClosed, None)?;
            let human = if data["paused"].as_bool().unwrap_or(false) {
                render::pause_outcome(&data["outcome"])
            } else {
                "no timer was running".to_string()
            };
            print(&data, human);
        }
    }

    Ok(())
}

fn describe(err: ClientError) -> String {
    match err {
        ClientError::Connect { .. } => format!("{} (is ticket-timer-daemon running?)", err),
        other => other.to_string(),
    }
}
