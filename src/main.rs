use clap::Parser;
use clawrden::audit::AuditLog;
use clawrden::hitl::HitlQueue;
use clawrden::http_api::HttpApi;
use clawrden::jailhouse::JailhouseManager;
use clawrden::policy::PolicyEngine;
use clawrden::server::{self, Supervisor};
use clawrden::watcher::PolicyWatcher;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

mod cli;
use crate::cli::Cli;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    use nix::sys::signal::{sigaction, SigAction, SigHandler, SaFlags, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    clawrden::logging_init();
    install_signal_handlers();

    let jailhouse = JailhouseManager::new(
        cli.armory_path.clone(),
        cli.jailhouse_path.clone(),
        cli.state_path.clone(),
    );
    if let Err(e) = jailhouse.start() {
        eprintln!("clawrden-warden: fatal: {e}");
        return ExitCode::FAILURE;
    }

    let policy = PolicyEngine::load_or_default(&cli.policy);
    for (jail_id, cfg) in &policy.config().jails {
        if jailhouse.get_jail(jail_id).is_none() {
            if let Err(e) = jailhouse.create_jail(jail_id, &cfg.commands, cfg.hardened) {
                eprintln!("clawrden-warden: warning: failed to create jail {jail_id}: {e}");
            }
        }
    }

    let audit = match AuditLog::open(&cli.audit) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("clawrden-warden: fatal: opening audit log: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match server::bind_listener(&cli.socket) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("clawrden-warden: fatal: binding socket {}: {e}", cli.socket.display());
            return ExitCode::FAILURE;
        }
    };

    let engine = Arc::new(RwLock::new(Arc::new(policy)));
    let sup = Arc::new(Supervisor::new(
        engine.clone(),
        Arc::new(HitlQueue::new()),
        Arc::new(audit),
        Arc::new(jailhouse),
    ));

    let mut http_api = None;
    if let Some(addr) = &cli.api {
        match HttpApi::spawn(addr, sup.clone()) {
            Ok(api) => http_api = Some(api),
            Err(e) => eprintln!("clawrden-warden: warning: HTTP API disabled: {e}"),
        }
    }

    let watcher = if cli.no_watch {
        None
    } else {
        match PolicyWatcher::spawn(cli.policy.clone(), engine, Vec::new()) {
            Ok(w) => Some(w),
            Err(e) => {
                eprintln!("clawrden-warden: warning: policy watcher disabled: {e}");
                None
            }
        }
    };

    let shutdown_sup = sup.clone();
    let shutdown_listener_check = std::thread::spawn(move || {
        while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        shutdown_sup.request_shutdown();
    });

    let result = server::serve(listener, sup);

    if let Some(mut api) = http_api {
        api.stop();
    }
    if let Some(w) = watcher {
        w.stop();
    }
    let _ = shutdown_listener_check.join();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("clawrden-warden: accept loop error: {e}");
            ExitCode::FAILURE
        }
    }
}
