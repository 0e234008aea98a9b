//! The shim: a small static binary that impersonates an intercepted tool,
//! forwards the invocation to the warden over a Unix socket, and relays
//! stdout/stderr/exit-code back to the prisoner process.
use clawrden::env_filter::SOCKET_ENV_VAR;
use clawrden::protocol::{self, Ack, Frame, FrameType, Identity, Request};
use std::io::Write;
use std::os::raw::c_int;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const DEFAULT_SOCKET: &str = "/var/run/clawrden/warden.sock";

static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_cancel_signal(_: c_int) {
    CANCEL_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(SigHandler::Handler(on_cancel_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

/// Watch for a pending signal and, once observed, write a cancel frame on a
/// clone of the connection and exit with code 130 (§4.2).
fn spawn_cancel_watcher(stream: &UnixStream) {
    let clone = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    std::thread::spawn(move || {
        let mut clone = clone;
        loop {
            if CANCEL_REQUESTED.load(Ordering::SeqCst) {
                let _ = protocol::write_frame(&mut clone, &Frame::cancel());
                std::process::exit(130);
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    });
}

fn tool_name() -> Option<String> {
    let argv0 = std::env::args().next()?;
    Path::new(&argv0).file_name().map(|n| n.to_string_lossy().to_string())
}

fn build_request(command: String, args: Vec<String>) -> Request {
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let identity = Identity { uid: nix::unistd::getuid().as_raw(), gid: nix::unistd::getgid().as_raw() };
    Request { command, args, cwd, env, identity, container_id: String::new() }
}

fn socket_path() -> String {
    std::env::var(SOCKET_ENV_VAR).unwrap_or_else(|_| DEFAULT_SOCKET.to_string())
}

fn frame_loop(stream: &mut UnixStream) -> i32 {
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    loop {
        let frame = match protocol::read_frame(stream) {
            Ok(f) => f,
            Err(_) => return 1,
        };
        match frame.kind {
            FrameType::Stdout => {
                let mut out = stdout.lock();
                let _ = out.write_all(&frame.payload);
                let _ = out.flush();
            }
            FrameType::Stderr => {
                let mut err = stderr.lock();
                let _ = err.write_all(&frame.payload);
                let _ = err.flush();
            }
            FrameType::Exit => return frame.exit_code().unwrap_or(1) as i32,
            FrameType::Cancel => continue,
        }
    }
}

fn run() -> i32 {
    let Some(name) = tool_name() else {
        eprintln!("clawrden-shim: cannot determine invoked tool name");
        return 1;
    };
    if name == "clawrden-shim" {
        eprintln!("usage: invoke this binary via a symlink named after the tool it intercepts");
        return 1;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = build_request(name, args);

    let mut stream = match UnixStream::connect(socket_path()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("clawrden-shim: cannot reach warden: {e}");
            return 1;
        }
    };

    install_signal_handlers();
    spawn_cancel_watcher(&stream);

    if protocol::write_request(&mut stream, &request).is_err() {
        eprintln!("clawrden-shim: failed to send request");
        return 1;
    }

    let first_ack = match protocol::read_ack(&mut stream) {
        Ok(a) => a,
        Err(_) => {
            eprintln!("clawrden-shim: warden closed the connection");
            return 1;
        }
    };

    let allowed = match first_ack {
        Ack::Allowed => true,
        Ack::Denied => {
            eprintln!("clawrden-shim: command denied by policy");
            return 1;
        }
        Ack::PendingHitl => {
            eprintln!("clawrden-shim: awaiting approval...");
            match protocol::read_ack(&mut stream) {
                Ok(Ack::Denied) | Err(_) => {
                    eprintln!("clawrden-shim: command denied by policy");
                    return 1;
                }
                Ok(_) => true,
            }
        }
    };

    if !allowed {
        return 1;
    }

    frame_loop(&mut stream)
}

fn main() {
    let code = run();
    std::process::exit(code);
}
