//! Local executor: runs the approved command directly on the warden host.
//! Used when no container ID was resolved for the peer (dev/test, or a
//! host-resident caller).
use super::{write_error_frame, ExecContext};
use crate::errors::ClawrdenError;
use crate::protocol::{self, Frame};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Instant;

/// Name of the jailhouse bin directory component, excluded from the PATH
/// scan so the local executor never re-enters the shim it is trying to
/// bypass.
pub const JAILHOUSE_DIR_MARKER: &str = "jailhouse";

fn validate_cwd(cwd: &str) -> Result<(), ClawrdenError> {
    if cwd.starts_with("/app") || cwd.starts_with("/tmp") {
        Ok(())
    } else {
        Err(ClawrdenError::PathViolation(format!(
            "{cwd} is outside /app or /tmp"
        )))
    }
}

/// Resolve `command` to an absolute path by scanning `PATH`, skipping any
/// entry that lives under a jailhouse directory.
pub fn resolve_binary(command: &str, path_env: &str) -> Option<std::path::PathBuf> {
    if command.contains('/') {
        return Some(std::path::PathBuf::from(command));
    }
    for dir in path_env.split(':') {
        if dir.is_empty() {
            continue;
        }
        if dir.contains(JAILHOUSE_DIR_MARKER) {
            continue;
        }
        let candidate = std::path::Path::new(dir).join(command);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

enum Msg {
    Line(bool, Vec<u8>),
    Done,
}

fn spawn_reader<R: std::io::Read + Send + 'static>(reader: R, is_stdout: bool, tx: Sender<Msg>) {
    thread::spawn(move || {
        let mut buf = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match buf.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Msg::Line(is_stdout, line)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(Msg::Done);
    });
}

pub fn execute<W: Write>(ctx: &ExecContext, conn: &mut W) -> Result<(), ClawrdenError> {
    if let Err(e) = validate_cwd(ctx.cwd) {
        write_error_frame(conn, &e.to_string());
        protocol::write_frame(conn, &Frame::exit(1))?;
        return Err(e);
    }

    let path_env = ctx
        .env
        .iter()
        .find_map(|e| e.strip_prefix("PATH=").map(str::to_string))
        .unwrap_or_default();
    let Some(bin) = resolve_binary(ctx.command, &path_env) else {
        let msg = format!("{}: command not found", ctx.command);
        write_error_frame(conn, &msg);
        protocol::write_frame(conn, &Frame::exit(1))?;
        return Err(ClawrdenError::ExecutionFailed(msg));
    };

    let mut command = Command::new(bin);
    command
        .args(ctx.args)
        .current_dir(ctx.cwd)
        .env_clear()
        .envs(ctx.env.iter().filter_map(|e| e.split_once('=')))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child: Child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let msg = format!("spawn failed: {e}");
            write_error_frame(conn, &msg);
            protocol::write_frame(conn, &Frame::exit(1))?;
            return Err(ClawrdenError::ExecutionFailed(msg));
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let (tx, rx) = channel();
    spawn_reader(stdout, true, tx.clone());
    spawn_reader(stderr, false, tx);

    let deadline = Instant::now() + ctx.timeout;
    let mut pending_eof = 0;
    loop {
        if ctx.cancel.try_recv().is_ok() {
            let _ = child.kill();
            let _ = child.wait();
            write_error_frame(conn, "execution cancelled");
            protocol::write_frame(conn, &Frame::exit(1))?;
            return Err(ClawrdenError::ExecutionFailed("cancelled".into()));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            write_error_frame(conn, "execution timed out");
            protocol::write_frame(conn, &Frame::exit(1))?;
            return Err(ClawrdenError::TimeoutExceeded(format!(
                "{} exceeded {:?}",
                ctx.command, ctx.timeout
            )));
        }
        match rx.recv_timeout(std::time::Duration::from_millis(50)) {
            Ok(Msg::Line(is_stdout, line)) => {
                let frame = if is_stdout { Frame::stdout(line) } else { Frame::stderr(line) };
                protocol::write_frame(conn, &frame)?;
            }
            Ok(Msg::Done) => {
                pending_eof += 1;
                if pending_eof >= 2 {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait().map_err(ClawrdenError::Io)?;
    let code = status.code().unwrap_or(1) as u8;
    protocol::write_frame(conn, &Frame::exit(code))?;
    Ok(())
}
