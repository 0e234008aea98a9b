//! The warden's local HTTP API: status, HITL queue inspection/resolution,
//! audit history, jailhouse CRUD and a kill-switch stub. Hand-rolled over
//! `TcpListener`, same posture as the mirror executor's Docker client: no
//! HTTP framework dependency for a handful of JSON endpoints.
use crate::audit::read_history;
use crate::server::Supervisor;
use crate::util::{find_header_end, url_decode};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BODY_LEN: usize = 1024 * 1024;

pub struct HttpApi {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HttpApi {
    /// Bind `addr` and start serving in a background thread. Accept errors
    /// (other than a clean listener shutdown) are logged, never fatal to the
    /// warden.
    pub fn spawn(addr: &str, sup: Arc<Supervisor>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                if stop2.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let sup = sup.clone();
                        thread::spawn(move || {
                            let _ = handle_client(stream, &sup);
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(25));
                    }
                    Err(_) => thread::sleep(Duration::from_millis(25)),
                }
            }
        });
        Ok(HttpApi { stop, handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for HttpApi {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_http_request(stream: &mut TcpStream) -> std::io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_BODY_LEN {
            return Err(std::io::Error::other("request headers too large"));
        }
    };

    let header_str = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = header_str.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let content_length: usize = header_str
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);
    Ok(HttpRequest { method, path, body })
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> std::io::Result<()> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    write_raw(stream, status, &payload)
}

fn write_raw(stream: &mut TcpStream, status: u16, payload: &[u8]) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        501 => "Not Implemented",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
    pending_count: usize,
}

#[derive(Serialize)]
struct QueueEntry {
    id: String,
    command: String,
    args: Vec<String>,
    cwd: String,
    identity: crate::protocol::Identity,
}

#[derive(Deserialize)]
struct CreateJailBody {
    jail_id: String,
    commands: Vec<String>,
    #[serde(default)]
    hardened: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl ErrorBody {
    fn other(message: impl Into<String>) -> Self {
        ErrorBody { error: message.into(), kind: "bad_request" }
    }

    fn from_error(e: &crate::errors::ClawrdenError) -> Self {
        ErrorBody { error: e.to_string(), kind: e.kind() }
    }
}

fn handle_client(mut stream: TcpStream, sup: &Supervisor) -> std::io::Result<()> {
    stream.set_read_timeout(Some(READ_WRITE_TIMEOUT))?;
    stream.set_write_timeout(Some(READ_WRITE_TIMEOUT))?;

    let req = read_http_request(&mut stream)?;
    route(&mut stream, &req, sup)
}

fn route(stream: &mut TcpStream, req: &HttpRequest, sup: &Supervisor) -> std::io::Result<()> {
    let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();

    match (req.method.as_str(), segments.as_slice()) {
        ("GET", ["api", "status"]) => {
            let body = StatusBody { status: "ok", pending_count: sup.queue.len() };
            write_json(stream, 200, &body)
        }
        ("GET", ["api", "queue"]) => {
            let entries: Vec<QueueEntry> = sup
                .queue
                .list()
                .into_iter()
                .map(|q| QueueEntry {
                    id: q.id,
                    command: q.request.command,
                    args: q.request.args,
                    cwd: q.request.cwd,
                    identity: q.request.identity,
                })
                .collect();
            write_json(stream, 200, &entries)
        }
        ("POST", ["api", "queue", id, decision @ ("approve" | "deny")]) => {
            let approve = *decision == "approve";
            let resolved = sup.queue.resolve(id, approve);
            if resolved {
                write_json(stream, 200, &StatusBody { status: "ok", pending_count: sup.queue.len() })
            } else {
                write_json(stream, 404, &ErrorBody::other(format!("no pending request {id}")))
            }
        }
        ("GET", ["api", "history"]) => match sup.audit.path() {
            Some(path) => match read_history(path) {
                Ok(entries) => write_json(stream, 200, &entries),
                Err(e) => write_json(stream, 500, &ErrorBody::other(e.to_string())),
            },
            None => write_json(stream, 200, &Vec::<()>::new()),
        },
        ("POST", ["api", "kill"]) => {
            // Container pause/kill semantics are implementation-dependent and
            // deliberately out of scope for the core (§9 open questions).
            write_json(stream, 501, &ErrorBody::other("kill switch not implemented"))
        }
        ("GET", ["api", "jails"]) => write_json(stream, 200, &sup.jailhouse.list_jails()),
        ("POST", ["api", "jails"]) => match serde_json::from_slice::<CreateJailBody>(&req.body) {
            Ok(body) => match sup.jailhouse.create_jail(&body.jail_id, &body.commands, body.hardened) {
                Ok(state) => write_json(stream, 201, &state),
                Err(e) => write_json(stream, status_for_error(&e), &ErrorBody::from_error(&e)),
            },
            Err(e) => write_json(stream, 400, &ErrorBody::other(e.to_string())),
        },
        ("GET", ["api", "jails", id]) => {
            let id = url_decode(id);
            match sup.jailhouse.get_jail(&id) {
                Some(state) => write_json(stream, 200, &state),
                None => write_json(stream, 404, &ErrorBody::other(format!("unknown jail {id}"))),
            }
        }
        ("DELETE", ["api", "jails", id]) => {
            let id = url_decode(id);
            match sup.jailhouse.destroy_jail(&id) {
                Ok(()) => write_raw(stream, 204, b""),
                Err(e) => write_json(stream, status_for_error(&e), &ErrorBody::from_error(&e)),
            }
        }
        _ => write_json(stream, 404, &ErrorBody::other("no such route")),
    }
}

/// Map an error's stable `kind()` to an HTTP status, never its `Display`
/// text (message wording is free to change without breaking clients).
fn status_for_error(e: &crate::errors::ClawrdenError) -> u16 {
    match e.kind() {
        "jailhouse_exists" => 409,
        "jailhouse_not_found" => 404,
        "jailhouse_conflict" | "path_violation" | "policy_denied" => 400,
        "protocol_violation" => 400,
        "timeout_exceeded" => 504,
        _ => 500,
    }
}
