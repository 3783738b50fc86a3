use std::io;
use std::time::Duration;

use pinrdma_mem::MemError;
use pinrdma_types::{status_code_t, RdmaCode, Status, StatusCode};
use thiserror::Error;

use crate::verbs::{VerbsError, VerbsOp, WcStatus};

/// Errors from session setup, transfer and teardown.
#[derive(Debug, Error)]
pub enum RdmaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The binary session record could not be decoded.
    #[error("bad session request: {0}")]
    BadRequest(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The control channel failed. A short send or receive lands here.
    #[error("control channel {op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("protocol violation in {phase}: {reason}")]
    Protocol { phase: &'static str, reason: String },

    /// The work request completed with a non-success status.
    #[error("work completion failed with {0:?}")]
    RemoteFailure(WcStatus),

    #[error(transparent)]
    Verbs(#[from] VerbsError),

    #[error(transparent)]
    Memory(#[from] MemError),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("session cancelled")]
    Cancelled,
}

impl RdmaError {
    pub fn transport(op: &'static str, source: io::Error) -> Self {
        RdmaError::Transport { op, source }
    }

    pub fn protocol(phase: &'static str, reason: impl Into<String>) -> Self {
        RdmaError::Protocol {
            phase,
            reason: reason.into(),
        }
    }

    /// True when the control channel failed because the peer went away.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            RdmaError::Transport { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn code(&self) -> status_code_t {
        match self {
            RdmaError::InvalidArgument(_) => StatusCode::INVALID_ARG,
            RdmaError::BadRequest(_) => RdmaCode::BAD_REQUEST,
            RdmaError::DeviceNotFound(_) => RdmaCode::DEVICE_NOT_FOUND,
            RdmaError::Transport { .. } => RdmaCode::TRANSPORT_ERROR,
            RdmaError::Protocol { .. } => RdmaCode::PROTOCOL_ERROR,
            RdmaError::RemoteFailure(_) => RdmaCode::REMOTE_FAILURE,
            RdmaError::Verbs(e) => match e.op {
                VerbsOp::PostSend | VerbsOp::PostRecv => RdmaCode::POST_FAILED,
                VerbsOp::PollCq => RdmaCode::POLL_FAILED,
                _ => RdmaCode::VERBS_ERROR,
            },
            RdmaError::Memory(e) => e.code(),
            RdmaError::Timeout { .. } => RdmaCode::TIMEOUT,
            RdmaError::Cancelled => RdmaCode::CANCELED,
        }
    }
}

impl From<&RdmaError> for Status {
    fn from(err: &RdmaError) -> Self {
        Status::with_message(err.code(), err.to_string())
    }
}

impl From<RdmaError> for Status {
    fn from(err: RdmaError) -> Self {
        Status::from(&err)
    }
}
