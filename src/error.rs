//! Typed error surface for the engine, matching the session-fatal error kinds.
//!
//! Per-cell execution failures (a traceback from the kernel) are deliberately
//! *not* represented here: they are recorded as `cell.error` and are not a
//! session error (see `crate::cell`).

use std::path::PathBuf;
use thiserror::Error;

/// Unclosed fence, unclosed comment, or unclosed prose region.
#[derive(Debug, Error)]
pub enum ParsingError {
    #[error("unclosed code fence starting at line {line}")]
    UnclosedFence { line: usize },
    #[error("unclosed HTML comment starting at line {line}")]
    UnclosedComment { line: usize },
    #[error("unclosed prose region starting at line {line}")]
    UnclosedProse { line: usize },
}

/// An unknown Jupyter message type or malformed envelope/wire frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognized jupyter message type {msg_type:?}")]
    UnknownMessageType { msg_type: String },
    #[error("unrecognized websocket frame kind {kind:?}")]
    UnknownFrameKind { kind: String },
    #[error("malformed jupyter envelope: {0}")]
    MalformedEnvelope(String),
}

/// Kernel process failed to start, or shut down unexpectedly.
#[derive(Debug, Error)]
pub enum KernelLifecycleError {
    #[error("failed to start kernel {name:?}: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("kernel exited unexpectedly: {0}")]
    UnexpectedExit(String),
}

/// No free port in the configured scan range.
#[derive(Debug, Error)]
#[error("no free port in range {start}..={end}")]
pub struct BindError {
    pub start: u16,
    pub end: u16,
}

/// A broken websocket peer. Dropping the peer is the whole remedy; this
/// type exists so the drop can be logged uniformly.
#[derive(Debug, Error)]
#[error("websocket peer {id} disconnected: {reason}")]
pub struct TransportError {
    pub id: u64,
    pub reason: String,
}

/// The top-level error a session can terminate with. Each variant maps to
/// a distinct non-zero process exit and a single identifying log line.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parsing(#[from] ParsingError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("kernel lifecycle error: {0}")]
    KernelLifecycle(#[from] KernelLifecycleError),
    #[error("bind error: {0}")]
    Bind(#[from] BindError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Parsing(_) => 1,
            EngineError::Protocol(_) => 2,
            EngineError::KernelLifecycle(_) => 3,
            EngineError::Bind(_) => 4,
            EngineError::Io { .. } => 5,
        }
    }
}
