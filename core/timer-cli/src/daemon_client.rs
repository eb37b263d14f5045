//! Blocking client for the ticket timer daemon socket.
//!
//! The daemon is the only writer. Every command is one request line and one
//! response line; `watch` keeps the connection open for push lines.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use ticket_timer_protocol::{Method, Push, Request, Response, MAX_REQUEST_BYTES};
use timer_core::StoragePaths;

const SOCKET_ENV: &str = "TICKET_TIMER_SOCKET";
const READ_TIMEOUT_MS: u64 = 3000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed daemon reply: {0}")]
    Protocol(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub fn socket_path() -> Result<PathBuf, String> {
    if let Some(path) = env::var_os(SOCKET_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(StoragePaths::from_env()?.socket_file())
}

pub struct DaemonClient {
    socket: PathBuf,
    client_id: String,
    request_seq: std::cell::Cell<u64>,
}

impl DaemonClient {
    pub fn new(socket: PathBuf, client_id: impl Into<String>) -> Self {
        Self {
            socket,
            client_id: client_id.into(),
            request_seq: std::cell::Cell::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one request and returns the `data` payload of a successful reply.
    /// A failed connection is retried once.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let request = self.request(method, params);
        let response = match self.send(&request) {
            Ok(response) => response,
            Err(ClientError::Connect { .. }) => {
                tracing::warn!(method = ?method, "Daemon connect failed; retrying once");
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                self.send(&request)?
            }
            Err(err) => return Err(err),
        };
        into_data(response)
    }

    /// Blocks on a `watch` stream, invoking `on_refresh` per push line until
    /// the daemon hangs up or the callback returns `false`.
    pub fn watch(&self, mut on_refresh: impl FnMut() -> bool) -> Result<(), ClientError> {
        let request = self.request(Method::Watch, None);
        let mut stream = self.connect()?;
        write_request(&mut stream, &request)?;
        stream.set_read_timeout(None)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        into_data(parse_response(line.trim().as_bytes())?)?;

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let push: Push = serde_json::from_str(line.trim())
                .map_err(|err| ClientError::Protocol(format!("unexpected push: {}", err)))?;
            match push {
                Push::RefreshTimers => {
                    if !on_refresh() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn request(&self, method: Method, params: Option<Value>) -> Request {
        let seq = self.request_seq.get() + 1;
        self.request_seq.set(seq);
        let mut request = Request::new(method, params).with_client_id(self.client_id.clone());
        request.id = Some(format!("{}-{}", self.client_id, seq));
        request
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }

    fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = self.connect()?;
        write_request(&mut stream, request)?;
        read_response(&mut stream)
    }
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), ClientError> {
    let mut line = serde_json::to_vec(request)
        .map_err(|err| ClientError::Protocol(format!("failed to encode request: {}", err)))?;
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.flush()?;
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::Protocol(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ClientError::Protocol(
                    "timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    parse_response(response_bytes)
}

fn parse_response(bytes: &[u8]) -> Result<Response, ClientError> {
    if bytes.is_empty() {
        return Err(ClientError::Protocol("daemon response was empty".to_string()));
    }
    serde_json::from_slice(bytes)
        .map_err(|err| ClientError::Protocol(format!("invalid response JSON: {}", err)))
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = response
        .error
        .map(|err| (err.code, err.message))
        .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
    Err(ClientError::Daemon { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;
    use std::thread;

    fn read_line(stream: &mut UnixStream) -> Request {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    fn serve_once(
        listener: UnixListener,
        reply: &'static str,
    ) -> (thread::JoinHandle<()>, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_line(&mut stream);
            tx.send(request).unwrap();
            stream.write_all(reply.as_bytes()).unwrap();
            stream.write_all(b"\n").unwrap();
        });
        (handle, rx)
    }

    #[test]
    fn call_sends_client_id_and_returns_data() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, requests) = serve_once(listener, r#"{"ok":true,"data":{"status":"ok"}}"#);

        let client = DaemonClient::new(socket, "tab-1");
        let data = client.call(Method::GetHealth, None).unwrap();
        server.join().unwrap();

        assert_eq!(data, json!({"status": "ok"}));
        let request = requests.recv().unwrap();
        assert_eq!(request.method, Method::GetHealth);
        assert_eq!(request.client_id.as_deref(), Some("tab-1"));
        assert_eq!(request.id.as_deref(), Some("tab-1-1"));
    }

    #[test]
    fn daemon_errors_keep_code_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, _requests) = serve_once(
            listener,
            r#"{"ok":false,"error":{"code":"validation_error","message":"seconds must be positive"}}"#,
        );

        let client = DaemonClient::new(socket, "tab-2");
        let err = client
            .call(
                Method::AddTimeToPhase,
                Some(json!({"ticket_id": "1", "seconds": 0})),
            )
            .unwrap_err();
        server.join().unwrap();

        match err {
            ClientError::Daemon { code, message } => {
                assert_eq!(code, "validation_error");
                assert_eq!(message, "seconds must be positive");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(dir.path().join("absent.sock"), "tab-3");
        let err = client.call(Method::GetHealth, None).unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[test]
    fn watch_counts_pushes_until_callback_stops() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_line(&mut stream);
            assert_eq!(request.method, Method::Watch);
            stream
                .write_all(b"{\"ok\":true,\"data\":{\"watching\":true}}\n")
                .unwrap();
            for _ in 0..3 {
                let _ = stream.write_all(b"\"refresh_timers\"\n");
            }
        });

        let client = DaemonClient::new(socket, "tab-4");
        let mut seen = 0;
        client
            .watch(|| {
                seen += 1;
                seen < 2
            })
            .unwrap();
        server.join().unwrap();
        assert_eq!(seen, 2);
    }
}
