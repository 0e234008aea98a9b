//! End-to-end scenarios driving a real warden accept loop over a Unix
//! socket, as a shim client would.
use clawrden::audit::{read_history, AuditLog};
use clawrden::hitl::HitlQueue;
use clawrden::jailhouse::JailhouseManager;
use clawrden::policy::{Action, PolicyConfig, PolicyEngine, Rule};
use clawrden::protocol::{self, Ack, Identity, Request};
use clawrden::server::{self, Supervisor};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, RwLock};
use std::time::Duration;

fn spawn_warden(policy: PolicyConfig) -> (std::path::PathBuf, tempfile::TempDir, Arc<Supervisor>) {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("warden.sock");
    let listener = server::bind_listener(&socket_path).unwrap();

    let engine = Arc::new(RwLock::new(Arc::new(PolicyEngine::new(policy))));
    let queue = Arc::new(HitlQueue::new());
    let audit = Arc::new(AuditLog::open(&dir.path().join("audit.ndjson")).unwrap());
    let jailhouse = Arc::new(JailhouseManager::new(
        dir.path().join("armory"),
        dir.path().join("jailhouse"),
        dir.path().join("state.json"),
    ));
    let sup = Arc::new(Supervisor::new(engine, queue, audit, jailhouse));

    let serve_sup = sup.clone();
    std::thread::spawn(move || {
        let _ = server::serve(listener, serve_sup);
    });
    // Give the nonblocking accept loop a moment to start polling.
    std::thread::sleep(Duration::from_millis(20));

    (socket_path, dir, sup)
}

fn sample_request(command: &str, args: &[&str], cwd: &str) -> Request {
    Request {
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: cwd.to_string(),
        env: vec!["PATH=/usr/bin:/bin".to_string(), "LD_PRELOAD=/evil.so".to_string(), "SECRET=x".to_string()],
        identity: Identity::default(),
        container_id: String::new(),
    }
}

fn drain_frames(stream: &mut UnixStream) -> (Vec<u8>, Vec<u8>, Option<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    loop {
        let frame = match protocol::read_frame(stream) {
            Ok(f) => f,
            Err(_) => break,
        };
        match frame.kind {
            protocol::FrameType::Stdout => stdout.extend_from_slice(&frame.payload),
            protocol::FrameType::Stderr => stderr.extend_from_slice(&frame.payload),
            protocol::FrameType::Exit => {
                exit_code = frame.exit_code();
                break;
            }
            protocol::FrameType::Cancel => {}
        }
    }
    (stdout, stderr, exit_code)
}

#[test]
fn allowed_echo_streams_stdout_and_audits_allow() {
    let mut policy = PolicyConfig::default();
    policy.default_action = Action::Deny;
    policy.allowed_paths = vec!["/tmp/*".to_string()];
    policy.rules.push(Rule { command: "echo".to_string(), action: Action::Allow, args: Vec::new(), reason: None, timeout: None });
    let (socket_path, _dir, sup) = spawn_warden(policy);

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    let request = sample_request("echo", &["hi"], "/tmp");
    protocol::write_request(&mut stream, &request).unwrap();
    let ack = protocol::read_ack(&mut stream).unwrap();
    assert_eq!(ack, Ack::Allowed);

    let (stdout, _stderr, exit_code) = drain_frames(&mut stream);
    assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hi");
    assert_eq!(exit_code, Some(0));

    let history = read_history(sup.audit.path().unwrap()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, "allow");
    assert_eq!(history[0].exit_code, 0);
}

#[test]
fn denied_sudo_gets_a_single_deny_ack_and_no_frames() {
    let policy = PolicyConfig::default(); // default_action: deny, no rules
    let (socket_path, _dir, sup) = spawn_warden(policy);

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    let request = sample_request("sudo", &["rm", "-rf", "/"], "/app");
    protocol::write_request(&mut stream, &request).unwrap();
    let ack = protocol::read_ack(&mut stream).unwrap();
    assert_eq!(ack, Ack::Denied);

    std::thread::sleep(Duration::from_millis(20));
    let history = read_history(sup.audit.path().unwrap()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].decision, "deny");
}

#[test]
fn path_violation_denies_before_policy_evaluation() {
    let mut policy = PolicyConfig::default();
    policy.allowed_paths = vec!["/app/*".to_string()];
    let (socket_path, _dir, sup) = spawn_warden(policy);

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    let request = sample_request("ls", &[], "/etc");
    protocol::write_request(&mut stream, &request).unwrap();
    let ack = protocol::read_ack(&mut stream).unwrap();
    assert_eq!(ack, Ack::Denied);

    std::thread::sleep(Duration::from_millis(20));
    let history = read_history(sup.audit.path().unwrap()).unwrap();
    assert_eq!(history[0].decision, "deny (path violation)");
    assert!(history[0].error.as_ref().unwrap().contains("/etc"));
}

#[test]
fn hitl_approve_unblocks_execution_and_audits_after_hitl() {
    let mut policy = PolicyConfig::default();
    policy.allowed_paths = vec!["/tmp/*".to_string()];
    policy.rules.push(Rule { command: "echo".to_string(), action: Action::Ask, args: Vec::new(), reason: None, timeout: None });
    let (socket_path, _dir, sup) = spawn_warden(policy);

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    let request = sample_request("echo", &["hi"], "/tmp");
    protocol::write_request(&mut stream, &request).unwrap();
    let first_ack = protocol::read_ack(&mut stream).unwrap();
    assert_eq!(first_ack, Ack::PendingHitl);

    // Wait for the request to land in the queue, then approve it.
    let mut pending_id = None;
    for _ in 0..50 {
        let pending = sup.queue.list();
        if let Some(p) = pending.first() {
            pending_id = Some(p.id.clone());
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let id = pending_id.expect("request did not reach the HITL queue");
    assert!(sup.queue.resolve(&id, true));

    let second_ack = protocol::read_ack(&mut stream).unwrap();
    assert_eq!(second_ack, Ack::Allowed);

    let (stdout, _stderr, exit_code) = drain_frames(&mut stream);
    assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hi");
    assert_eq!(exit_code, Some(0));

    std::thread::sleep(Duration::from_millis(20));
    let history = read_history(sup.audit.path().unwrap()).unwrap();
    assert_eq!(history[0].decision, "allow (after HITL)");
}

#[test]
fn hitl_deny_after_connection_close_records_deny_after_hitl() {
    let mut policy = PolicyConfig::default();
    policy.allowed_paths = vec!["/tmp/*".to_string()];
    policy.rules.push(Rule { command: "echo".to_string(), action: Action::Ask, args: Vec::new(), reason: None, timeout: None });
    let (socket_path, _dir, sup) = spawn_warden(policy);

    {
        let mut stream = UnixStream::connect(&socket_path).unwrap();
        let request = sample_request("echo", &["hi"], "/tmp");
        protocol::write_request(&mut stream, &request).unwrap();
        let first_ack = protocol::read_ack(&mut stream).unwrap();
        assert_eq!(first_ack, Ack::PendingHitl);
        // Drop the connection while the request is still pending; the
        // cancel-monitor observes the close and the HITL wait resolves deny.
    }

    std::thread::sleep(Duration::from_millis(200));
    let history = read_history(sup.audit.path().unwrap()).unwrap();
    assert_eq!(history[0].decision, "deny (after HITL)");
}

#[test]
fn environment_is_scrubbed_before_reaching_the_executor() {
    let mut policy = PolicyConfig::default();
    policy.allowed_paths = vec!["/tmp/*".to_string()];
    policy.rules.push(Rule { command: "env".to_string(), action: Action::Allow, args: Vec::new(), reason: None, timeout: None });
    let (socket_path, _dir, _sup) = spawn_warden(policy);

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    let request = sample_request("env", &[], "/tmp");
    protocol::write_request(&mut stream, &request).unwrap();
    let ack = protocol::read_ack(&mut stream).unwrap();
    assert_eq!(ack, Ack::Allowed);

    let (stdout, _stderr, _exit_code) = drain_frames(&mut stream);
    let text = String::from_utf8_lossy(&stdout);
    assert!(text.contains("PATH="));
    assert!(!text.contains("LD_PRELOAD"));
    assert!(!text.contains("SECRET"));
}

#[test]
fn jailhouse_create_then_destroy_round_trips_state() {
    let dir = tempfile::tempdir().unwrap();
    let armory = dir.path().join("armory");
    std::fs::create_dir_all(&armory).unwrap();
    let shim = armory.join("clawrden-shim");
    std::fs::write(&shim, b"#!/bin/sh\n").unwrap();
    let mut perms = std::fs::metadata(&shim).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o555);
    std::fs::set_permissions(&shim, perms).unwrap();

    let mgr = JailhouseManager::new(armory.clone(), dir.path().join("jailhouse"), dir.path().join("state.json"));
    mgr.start().unwrap();

    let state = mgr.create_jail("j1", &["ls".to_string(), "npm".to_string()], false).unwrap();
    let target = std::fs::read_link(state.jail_path.join("bin").join("npm")).unwrap();
    assert_eq!(target, std::fs::canonicalize(&shim).unwrap());
    assert!(target.is_absolute());

    mgr.destroy_jail("j1").unwrap();
    assert!(!state.jail_path.exists());
    assert!(mgr.get_jail("j1").is_none());
}
