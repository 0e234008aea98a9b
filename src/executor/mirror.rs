//! Mirror executor: runs the approved command back inside the peer's own
//! container via the Docker Engine API's exec endpoints, reached directly
//! over `/var/run/docker.sock` (no SDK dependency, same hand-rolled-HTTP
//! posture as the HTTP API).
use super::{write_error_frame, ExecContext};
use crate::errors::ClawrdenError;
use crate::protocol::{self, Frame};
use crate::util::find_header_end;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

const DOCKER_SOCK: &str = "/var/run/docker.sock";

/// Commands that, per policy, launch a one-shot ephemeral "ghost" container
/// instead of execing into the peer's own container. The ghost path itself
/// is out of scope for the core (§4.7, §9 open questions) — this list exists
/// so callers can recognize the case and skip mirror dispatch for it.
pub const GHOST_COMMANDS: &[&str] = &["npm", "pip", "terraform", "kubectl"];

pub fn is_ghost_command(command: &str) -> bool {
    GHOST_COMMANDS.contains(&command)
}

fn http_request(
    stream: &mut UnixStream,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<(u16, Vec<u8>), ClawrdenError> {
    let mut req = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(body);
    stream.write_all(&req)?;

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
        if buf.len() > 64 * 1024 {
            return Err(ClawrdenError::ExecutionFailed(
                "docker socket response headers too large".into(),
            ));
        }
    };

    let header_str = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let status = header_str
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let content_length: usize = header_str
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body_out = buf[header_end..].to_vec();
    while body_out.len() < content_length {
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        body_out.extend_from_slice(&tmp[..n]);
    }
    Ok((status, body_out))
}

fn json_string_field(body: &[u8], key: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    v.get(key)?.as_str().map(str::to_string)
}

pub fn execute<W: Write>(ctx: &ExecContext, conn: &mut W) -> Result<(), ClawrdenError> {
    let user = format!("{}:{}", ctx.identity.uid, ctx.identity.gid);
    let create_body = serde_json::json!({
        "Cmd": std::iter::once(ctx.command).chain(ctx.args.iter().map(|s| s.as_str())).collect::<Vec<_>>(),
        "WorkingDir": ctx.cwd,
        "Env": ctx.env,
        "User": user,
        "AttachStdout": true,
        "AttachStderr": true,
    });

    let mut stream = UnixStream::connect(DOCKER_SOCK)
        .map_err(|e| ClawrdenError::ExecutionFailed(format!("connecting to docker socket: {e}")))?;

    let (status, body) = http_request(
        &mut stream,
        "POST",
        &format!("/containers/{}/exec", ctx.container_id),
        &serde_json::to_vec(&create_body).unwrap(),
    )?;
    if status >= 300 {
        let msg = format!("exec create failed: HTTP {status}");
        write_error_frame(conn, &msg);
        protocol::write_frame(conn, &Frame::exit(1))?;
        return Err(ClawrdenError::ExecutionFailed(msg));
    }
    let exec_id = json_string_field(&body, "Id").ok_or_else(|| {
        ClawrdenError::ExecutionFailed("exec create response missing Id".into())
    })?;

    let start_body = serde_json::json!({ "Detach": false, "Tty": false });
    let mut start_req = format!(
        "POST /exec/{exec_id}/start HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        serde_json::to_vec(&start_body).unwrap().len()
    )
    .into_bytes();
    start_req.extend_from_slice(&serde_json::to_vec(&start_body).unwrap());
    stream.write_all(&start_req)?;

    demux_and_stream(&mut stream, ctx, conn)?;

    let mut inspect_sock = UnixStream::connect(DOCKER_SOCK)?;
    let (_status, inspect_body) = http_request(
        &mut inspect_sock,
        "GET",
        &format!("/exec/{exec_id}/json"),
        b"",
    )?;
    let exit_code = serde_json::from_slice::<serde_json::Value>(&inspect_body)
        .ok()
        .and_then(|v| v.get("ExitCode").and_then(|c| c.as_i64()))
        .unwrap_or(1) as u8;

    protocol::write_frame(conn, &Frame::exit(exit_code))?;
    Ok(())
}

/// Read the hijacked raw stream and demultiplex Docker's 8-byte-header
/// chunks (1-byte stream type, 3 reserved, 4-byte BE size) into wire frames.
fn demux_and_stream<W: Write>(
    stream: &mut UnixStream,
    ctx: &ExecContext,
    conn: &mut W,
) -> Result<(), ClawrdenError> {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .map_err(ClawrdenError::Io)?;

    let mut buf = Vec::new();
    let mut header_consumed = false;
    let mut tmp = [0u8; 8192];
    let deadline = Instant::now() + ctx.timeout;

    loop {
        if ctx.cancel.try_recv().is_ok() {
            return Err(ClawrdenError::ExecutionFailed("cancelled".into()));
        }
        if Instant::now() >= deadline {
            return Err(ClawrdenError::TimeoutExceeded(format!(
                "{} exceeded {:?}",
                ctx.command, ctx.timeout
            )));
        }

        match stream.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(ClawrdenError::Io(e)),
        }

        if !header_consumed {
            match find_header_end(&buf) {
                Some(end) => {
                    buf.drain(..end);
                    header_consumed = true;
                }
                None => continue,
            }
        }

        loop {
            if buf.len() < 8 {
                break;
            }
            let stream_type = buf[0];
            let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            if buf.len() < 8 + size {
                break;
            }
            let payload = buf[8..8 + size].to_vec();
            buf.drain(..8 + size);
            let frame = match stream_type {
                1 => Frame::stdout(payload),
                2 => Frame::stderr(payload),
                _ => continue,
            };
            protocol::write_frame(conn, &frame)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ghost_commands_are_recognized() {
        assert!(is_ghost_command("npm"));
        assert!(is_ghost_command("terraform"));
        assert!(!is_ghost_command("echo"));
    }
}
