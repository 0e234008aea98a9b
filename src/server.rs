//! The warden's accept loop and per-connection state machine: the component
//! that ties policy, HITL, the executors, the jailhouse and the audit log
//! together for every accepted shim connection.
use crate::audit::{AuditEntry, AuditLog};
use crate::env_filter;
use crate::errors::ClawrdenError;
use crate::executor::{ExecContext, Executor};
use crate::hitl::HitlQueue;
use crate::jailhouse::JailhouseManager;
use crate::peercred;
use crate::policy::{Action, PolicyEngine};
use crate::protocol::{self, Ack, Request};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Everything a connection handler needs, shared across the life of the
/// warden process. Owned by one value in `main`, never a global.
pub struct Supervisor {
    pub engine: Arc<RwLock<Arc<PolicyEngine>>>,
    pub queue: Arc<HitlQueue>,
    pub audit: Arc<AuditLog>,
    pub jailhouse: Arc<JailhouseManager>,
    shutting_down: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        engine: Arc<RwLock<Arc<PolicyEngine>>>,
        queue: Arc<HitlQueue>,
        audit: Arc<AuditLog>,
        jailhouse: Arc<JailhouseManager>,
    ) -> Self {
        Supervisor { engine, queue, audit, jailhouse, shutting_down: Arc::new(AtomicBool::new(false)) }
    }

    pub fn current_policy(&self) -> Arc<PolicyEngine> {
        self.engine.read().unwrap().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

/// Remove a stale socket file, bind, and chmod 0666 so prisoners running as
/// arbitrary UIDs inside a container can connect (§6).
pub fn bind_listener(socket_path: &std::path::Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    let mut perms = std::fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(socket_path, perms)?;
    Ok(listener)
}

/// Run the accept loop until `sup.request_shutdown()` is observed from
/// another thread (typically the signal handler in `main`).
pub fn serve(listener: UnixListener, sup: Arc<Supervisor>) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    loop {
        if sup.is_shutting_down() {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let sup = sup.clone();
                thread::spawn(move || handle_connection(stream, &sup));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(_) => thread::sleep(Duration::from_millis(25)),
        }
    }
}

/// Spawn the cancel-monitor: it blocks on reads from `stream` and signals
/// cancellation on any result, including EOF, per §4.12 step 2. The monitor
/// owns a cloned stream so the main handler thread keeps its own for writes.
fn spawn_cancel_monitor(mut stream: UnixStream) -> std::sync::mpsc::Receiver<()> {
    let (tx, rx) = channel();
    thread::spawn(move || {
        // Any read result, including a protocol error or EOF, is treated
        // as cancellation per §4.12 step 2.
        let _ = protocol::read_frame(&mut stream);
        let _ = tx.send(());
    });
    rx
}

fn decision_label(base: &str, after_hitl: bool) -> String {
    if after_hitl {
        format!("{base} (after HITL)")
    } else {
        base.to_string()
    }
}

fn audit_and_log(sup: &Supervisor, entry: AuditEntry) {
    if let Err(e) = sup.audit.append(&entry) {
        eprintln!("clawrden: audit write failed: {e}");
    }
}

fn handle_connection(mut stream: UnixStream, sup: &Supervisor) {
    let started = Instant::now();
    let creds = peercred::peer_credentials(&stream).ok();

    let mut request = match protocol::read_request(&mut stream) {
        Ok(r) => r,
        Err(_) => return,
    };

    // The cancel-monitor only matters once the request is past this point
    // (HITL wait, execution); starting it earlier would race the main
    // thread's read of the request over the same socket.
    let cancel_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let cancel_rx = spawn_cancel_monitor(cancel_stream);

    if let Some(creds) = creds {
        request.identity = creds.into();
        request.container_id = peercred::resolve_container_id(creds.pid);
    }

    let mut entry = AuditEntry {
        timestamp: crate::audit::rfc3339_nano_now(),
        command: request.command.clone(),
        args: request.args.clone(),
        cwd: request.cwd.clone(),
        identity: request.identity,
        container_id: request.container_id.clone(),
        decision: String::new(),
        exit_code: 1,
        duration_ms: 0,
        timeout_violation: false,
        error: None,
        error_kind: None,
    };

    let policy = sup.current_policy();

    if let Err(e) = policy.validate_path(&request.cwd) {
        entry.decision = "deny (path violation)".to_string();
        entry.error_kind = Some(e.kind().to_string());
        entry.error = Some(e.to_string());
        entry.duration_ms = started.elapsed().as_millis() as u64;
        audit_and_log(sup, entry);
        let _ = protocol::write_ack(&mut stream, Ack::Denied);
        return;
    }

    request.env = env_filter::scrub(&request.env);

    let evaluation = policy.evaluate(&request.command, &request.args);
    let mut after_hitl = false;

    let approved = match evaluation.action {
        Action::Deny => {
            let e = ClawrdenError::PolicyDenied(
                evaluation.reason.clone().unwrap_or_else(|| "no matching allow rule".to_string()),
            );
            entry.decision = "deny".to_string();
            entry.error_kind = Some(e.kind().to_string());
            entry.error = Some(e.to_string());
            entry.duration_ms = started.elapsed().as_millis() as u64;
            audit_and_log(sup, entry);
            let _ = protocol::write_ack(&mut stream, Ack::Denied);
            return;
        }
        Action::Ask => {
            after_hitl = true;
            if protocol::write_ack(&mut stream, Ack::PendingHitl).is_err() {
                return;
            }
            let (_id, decision) = sup.queue.enqueue_and_wait(request.clone(), &cancel_rx);
            decision
        }
        Action::Allow => true,
    };

    if !approved {
        let e = ClawrdenError::PolicyDenied(
            evaluation.reason.clone().unwrap_or_else(|| "rejected via HITL".to_string()),
        );
        entry.decision = decision_label("deny", after_hitl);
        entry.error_kind = Some(e.kind().to_string());
        entry.error = Some(e.to_string());
        entry.duration_ms = started.elapsed().as_millis() as u64;
        audit_and_log(sup, entry);
        let _ = protocol::write_ack(&mut stream, Ack::Denied);
        return;
    }

    entry.decision = decision_label("allow", after_hitl);
    if protocol::write_ack(&mut stream, Ack::Allowed).is_err() {
        return;
    }

    let executor = Executor::select(&request.container_id);
    let ctx = ExecContext {
        command: &request.command,
        args: &request.args,
        cwd: &request.cwd,
        env: &request.env,
        identity: request.identity,
        container_id: &request.container_id,
        timeout: evaluation.timeout,
        cancel: &cancel_rx,
    };

    match executor.execute(&ctx, &mut stream) {
        Ok(()) => {
            entry.exit_code = 0;
        }
        Err(e) => {
            entry.exit_code = 1;
            entry.timeout_violation = matches!(e, ClawrdenError::TimeoutExceeded(_));
            entry.error_kind = Some(e.kind().to_string());
            entry.error = Some(e.to_string());
        }
    }
    entry.duration_ms = started.elapsed().as_millis() as u64;
    audit_and_log(sup, entry);
}

/// Type alias kept for readers who expect a `Sender<()>` handle for manual
/// cancellation injection in tests.
pub type CancelSender = Sender<()>;
