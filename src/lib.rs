//! Clawrden: a zero-trust command-interception supervisor for autonomous
//! agents running inside Linux containers.
//!
//! Architecture
//! - Binary glue (src/main.rs) parses CLI flags, loads the policy and
//!   armory/jailhouse state, and drives the accept loop.
//! - `protocol`: the length-prefixed wire format shared by the shim and the
//!   warden (request, ack, frame).
//! - `policy`: the declarative rule engine and path validator.
//! - `peercred`/`env_filter`: identity and environment hardening applied to
//!   every accepted connection before a command is evaluated.
//! - `hitl`: the human-in-the-loop approval queue for `ask` rules.
//! - `executor`: dispatches an approved command to the peer's own container
//!   (mirror) or the warden host (local), streaming output back as frames.
//! - `jailhouse`: the armory/jailhouse filesystem that projects the shim
//!   binary into containers via symlinks, and its persisted state.
//! - `audit`: the append-only NDJSON decision log.
//! - `watcher`: hot-reloads the policy file on change.
//! - `server`: the accept loop and per-connection state machine tying the
//!   above together.
//! - `http_api`: the optional local HTTP surface for status/queue/history.
pub mod audit;
pub mod env_filter;
pub mod errors;
pub mod executor;
pub mod hitl;
pub mod http_api;
pub mod jailhouse;
pub mod peercred;
pub mod policy;
pub mod protocol;
pub mod server;
pub mod util;
pub mod watcher;

pub use errors::ClawrdenError;

#[cfg(feature = "otel")]
pub fn logging_init() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(not(feature = "otel"))]
pub fn logging_init() {}
