//! The executor abstraction: a sum type over where an approved command
//! actually runs, dispatched by container-ID presence.
pub mod local;
pub mod mirror;

use crate::errors::ClawrdenError;
use crate::protocol::{Frame, Identity};
use std::io::Write;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Everything an executor needs to run one approved command and stream its
/// output back over the connection.
pub struct ExecContext<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: &'a str,
    pub env: &'a [String],
    pub identity: Identity,
    pub container_id: &'a str,
    pub timeout: Duration,
    pub cancel: &'a Receiver<()>,
}

pub enum Executor {
    Mirror,
    Local,
}

impl Executor {
    /// Select mirror when a container ID is present, else local (§4.12.9).
    pub fn select(container_id: &str) -> Self {
        if container_id.is_empty() {
            Executor::Local
        } else {
            Executor::Mirror
        }
    }

    pub fn execute<W: Write>(
        &self,
        ctx: &ExecContext,
        conn: &mut W,
    ) -> Result<(), ClawrdenError> {
        match self {
            Executor::Mirror => mirror::execute(ctx, conn),
            Executor::Local => local::execute(ctx, conn),
        }
    }
}

/// Write a best-effort stderr frame describing a launch/runtime failure
/// before the caller writes the final exit frame.
pub fn write_error_frame<W: Write>(conn: &mut W, message: &str) {
    let frame = Frame::stderr(message.as_bytes().to_vec());
    let _ = crate::protocol::write_frame(conn, &frame);
}
