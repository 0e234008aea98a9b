//! Error taxonomy shared across the protocol, policy, executor and server layers.
//!
//! Every variant maps to a disposition documented at its call site (audit
//! entry, HTTP status, ack byte); none is meant to propagate to the process
//! boundary unmapped.
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ClawrdenError {
    PolicyDenied(String),
    PathViolation(String),
    ExecutionFailed(String),
    TimeoutExceeded(String),
    ProtocolViolation(String),
    JailhouseConflict(String),
    JailhouseExists(String),
    JailhouseNotFound(String),
    Io(io::Error),
}

impl ClawrdenError {
    /// Stable short identifier used in audit entries and HTTP error bodies.
    /// Callers (audit log, HTTP API) classify on this, never on the
    /// `Display` text.
    pub fn kind(&self) -> &'static str {
        match self {
            ClawrdenError::PolicyDenied(_) => "policy_denied",
            ClawrdenError::PathViolation(_) => "path_violation",
            ClawrdenError::ExecutionFailed(_) => "execution_failed",
            ClawrdenError::TimeoutExceeded(_) => "timeout_exceeded",
            ClawrdenError::ProtocolViolation(_) => "protocol_violation",
            ClawrdenError::JailhouseConflict(_) => "jailhouse_conflict",
            ClawrdenError::JailhouseExists(_) => "jailhouse_exists",
            ClawrdenError::JailhouseNotFound(_) => "jailhouse_not_found",
            ClawrdenError::Io(_) => "io",
        }
    }
}

impl fmt::Display for ClawrdenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClawrdenError::PolicyDenied(s) => write!(f, "policy denied: {s}"),
            ClawrdenError::PathViolation(s) => write!(f, "path violation: {s}"),
            ClawrdenError::ExecutionFailed(s) => write!(f, "execution failed: {s}"),
            ClawrdenError::TimeoutExceeded(s) => write!(f, "timeout exceeded: {s}"),
            ClawrdenError::ProtocolViolation(s) => write!(f, "protocol violation: {s}"),
            ClawrdenError::JailhouseConflict(s) => write!(f, "jailhouse conflict: {s}"),
            ClawrdenError::JailhouseExists(s) => write!(f, "jailhouse conflict: {s}"),
            ClawrdenError::JailhouseNotFound(s) => write!(f, "jailhouse error: {s}"),
            ClawrdenError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClawrdenError {}

impl From<io::Error> for ClawrdenError {
    fn from(e: io::Error) -> Self {
        ClawrdenError::Io(e)
    }
}
