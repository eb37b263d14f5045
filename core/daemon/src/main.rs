//! Ticket timer daemon entrypoint.
//!
//! A small, single-writer service that owns the timer state for every
//! client on the machine: a socket listener, strict request validation, the
//! time engine over a SQLite key-value store, and a `watch` stream that tells
//! clients when to re-read.

use fs_err as fs;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ticket_timer_protocol::{
    ErrorInfo, Method, Push, Request, Response, ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES,
};
use timer_core::{
    load_config, on_startup, on_teardown, OriginId, StoragePaths, SyncHub, SystemClock,
    SyncSubscription, TeardownReason, TimeEngine, TimerConfig,
};

mod db;
mod handlers;
mod store;

use db::Db;
use handlers::{handle_request, DaemonContext};
use store::SqliteStore;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const MAX_ACTIVE_CONNECTIONS: usize = 64;

#[tokio::main]
async fn main() {
    init_logging();

    let paths = match StoragePaths::from_env() {
        Ok(paths) => paths,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon data directory");
            std::process::exit(1);
        }
    };

    let config = match load_config(&paths.config_file()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load timer config; using defaults");
            TimerConfig::default()
        }
    };

    let socket_path = paths.socket_file();
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db = match Db::new(paths.database_file()) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };
    info!(path = %db.path().display(), "Timer database ready");

    let hub = SyncHub::default();
    let engine = TimeEngine::new(
        Arc::new(SqliteStore::new(db)),
        Arc::new(SystemClock),
        config.engine.clone(),
    )
    .with_notifier(hub.notifier(OriginId::generate()));

    on_startup(&engine).await;

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        known_phases = config.phases.known.len(),
        max_elapsed_days = config.engine.max_elapsed_days,
        "Ticket timer daemon started"
    );

    let ctx = Arc::new(DaemonContext::new(engine, hub, &config, paths.exports_dir()));
    let permits = Arc::new(Semaphore::new(MAX_ACTIVE_CONNECTIONS));

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&ctx), permits) => {}
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    ctx.begin_shutdown();
    on_teardown(&ctx.engine, TeardownReason::Signal, ctx.teardown_timeout).await;
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket on exit");
    }
    info!("Ticket timer daemon stopped");
}

async fn accept_loop(listener: UnixListener, ctx: Arc<DaemonContext>, permits: Arc<Semaphore>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    warn!("Too many active connections; rejecting");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "daemon is at its connection limit",
                    );
                    let _ = write_line(&mut stream, &response).await;
                    continue;
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                    drop(permit);
                });
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_logging() {
    let debug_enabled = env::var("TICKET_TIMER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, ctx: Arc<DaemonContext>) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_line(&mut stream, &response).await;
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    // Subscribe before acknowledging so no change after the ack is missed.
    let subscription = match request.method {
        Method::Watch => {
            let origin = request
                .client_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .map(OriginId::from)
                .unwrap_or_else(OriginId::generate);
            Some(ctx.hub.subscribe(origin))
        }
        _ => None,
    };

    let response = handle_request(request, &ctx).await;
    let accepted = response.ok;
    if write_line(&mut stream, &response).await.is_err() {
        return;
    }

    if let (Some(subscription), true) = (subscription, accepted) {
        stream_refreshes(stream, subscription).await;
    }
}

/// Holds a `watch` connection open, writing one `refresh_timers` line per
/// change made by another client, until the client hangs up.
async fn stream_refreshes(mut stream: UnixStream, mut subscription: SyncSubscription) {
    let origin = subscription.origin().clone();
    info!(%origin, "Watch subscriber connected");
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            signal = subscription.recv() => match signal {
                Some(signal) => {
                    tracing::debug!(%origin, from = %signal.origin, "Pushing refresh");
                    if write_line(&mut stream, &Push::RefreshTimers).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = stream.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }

    info!(%origin, "Watch subscriber disconnected");
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    match tokio::time::timeout(Duration::from_secs(READ_TIMEOUT_SECS), read_line(stream)).await {
        Ok(result) => result,
        Err(_) => Err(ErrorInfo::new("read_timeout", "request timed out")),
    }
}

async fn read_line(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

async fn write_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await
}
