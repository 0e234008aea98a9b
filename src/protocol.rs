//! Wire protocol between the shim and the warden: one request, one or two
//! ack bytes, then zero or more frames terminated by an exit frame.
//!
//! Framing is hand-rolled rather than pulled from a serialization crate so
//! that the shim side stays a single small static binary with no dependency
//! beyond `serde_json` for the request body.
use crate::errors::ClawrdenError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Requests over 10 MiB are rejected before the body is even parsed.
pub const MAX_REQUEST_LEN: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Request {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: Vec<String>,
    pub identity: Identity,
    #[serde(default)]
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Allowed,
    Denied,
    PendingHitl,
}

impl Ack {
    fn to_byte(self) -> u8 {
        match self {
            Ack::Allowed => 0,
            Ack::Denied => 1,
            Ack::PendingHitl => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, ClawrdenError> {
        match b {
            0 => Ok(Ack::Allowed),
            1 => Ok(Ack::Denied),
            2 => Ok(Ack::PendingHitl),
            other => Err(ClawrdenError::ProtocolViolation(format!(
                "unknown ack byte {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Stdout,
    Stderr,
    Exit,
    Cancel,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            FrameType::Stdout => 1,
            FrameType::Stderr => 2,
            FrameType::Exit => 3,
            FrameType::Cancel => 4,
        }
    }

    fn from_byte(b: u8) -> Result<Self, ClawrdenError> {
        match b {
            1 => Ok(FrameType::Stdout),
            2 => Ok(FrameType::Stderr),
            3 => Ok(FrameType::Exit),
            4 => Ok(FrameType::Cancel),
            other => Err(ClawrdenError::ProtocolViolation(format!(
                "unknown frame type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn stdout(payload: Vec<u8>) -> Self {
        Frame { kind: FrameType::Stdout, payload }
    }

    pub fn stderr(payload: Vec<u8>) -> Self {
        Frame { kind: FrameType::Stderr, payload }
    }

    pub fn exit(code: u8) -> Self {
        Frame { kind: FrameType::Exit, payload: vec![code] }
    }

    pub fn cancel() -> Self {
        Frame { kind: FrameType::Cancel, payload: Vec::new() }
    }

    pub fn exit_code(&self) -> Option<u8> {
        if self.kind == FrameType::Exit {
            self.payload.first().copied()
        } else {
            None
        }
    }
}

pub fn write_request<W: Write>(w: &mut W, req: &Request) -> Result<(), ClawrdenError> {
    let body = serde_json::to_vec(req)
        .map_err(|e| ClawrdenError::ProtocolViolation(format!("encoding request: {e}")))?;
    if body.len() as u64 > MAX_REQUEST_LEN as u64 {
        return Err(ClawrdenError::ProtocolViolation(
            "request exceeds 10 MiB cap".into(),
        ));
    }
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)?;
    Ok(())
}

pub fn read_request<R: Read>(r: &mut R) -> Result<Request, ClawrdenError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_REQUEST_LEN {
        return Err(ClawrdenError::ProtocolViolation(
            "request exceeds 10 MiB cap".into(),
        ));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map_err(|e| ClawrdenError::ProtocolViolation(format!("decoding request: {e}")))
}

pub fn write_ack<W: Write>(w: &mut W, ack: Ack) -> Result<(), ClawrdenError> {
    w.write_all(&[ack.to_byte()])?;
    Ok(())
}

pub fn read_ack<R: Read>(r: &mut R) -> Result<Ack, ClawrdenError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ack::from_byte(b[0])
}

pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> Result<(), ClawrdenError> {
    w.write_all(&[frame.kind.to_byte()])?;
    w.write_all(&(frame.payload.len() as u32).to_be_bytes())?;
    w.write_all(&frame.payload)?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame, ClawrdenError> {
    let mut type_buf = [0u8; 1];
    r.read_exact(&mut type_buf)?;
    let kind = FrameType::from_byte(type_buf[0])?;
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(Frame { kind, payload })
}
