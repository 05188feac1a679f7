//! Error taxonomy for the RPC engine.
//!
//! Errors fall into four groups:
//! - **transport**: connect/send/receive failures and misframed records,
//! - **envelope**: the server rejected or could not run the call,
//! - **application**: the server ran the procedure and returned a non-zero
//!   status word ([`RpcError::Server`]),
//! - **call-fatal**: the call was given up locally (retry budget exhausted,
//!   cancelled, or past its deadline).

use thiserror::Error;

use crate::registry::SoftTerm;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("socket not connected")]
    NotConnected,
    #[error("record of {0} bytes exceeds maximum packet size")]
    RecordTooLarge(usize),
    #[error("malformed RPC message: {0}")]
    Malformed(String),

    #[error("RPC version mismatch (server supports {low}..={high})")]
    RpcMismatch { low: u32, high: u32 },
    #[error("authentication rejected (auth_stat {0})")]
    AuthRejected(u32),
    #[error("program unavailable")]
    ProgramUnavailable,
    #[error("program version mismatch (server supports {low}..={high})")]
    ProgramMismatch { low: u32, high: u32 },
    #[error("procedure unavailable")]
    ProcedureUnavailable,
    #[error("server could not decode arguments")]
    GarbageArgs,
    #[error("server system error")]
    SystemError,

    #[error("server returned status {0}")]
    Server(u32),

    #[error("server not responding, retry budget exhausted")]
    TimedOut,
    #[error("call interrupted")]
    Interrupted,
    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RpcError {
    /// `true` for errors the server sent back in a well-formed reply.
    ///
    /// Retrying these cannot change the outcome.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            RpcError::RpcMismatch { .. }
                | RpcError::AuthRejected(_)
                | RpcError::ProgramUnavailable
                | RpcError::ProgramMismatch { .. }
                | RpcError::ProcedureUnavailable
                | RpcError::GarbageArgs
                | RpcError::SystemError
                | RpcError::Server(_)
        )
    }
}

impl From<SoftTerm> for RpcError {
    fn from(why: SoftTerm) -> Self {
        match why {
            SoftTerm::RetriesExhausted => RpcError::TimedOut,
            SoftTerm::Interrupted => RpcError::Interrupted,
            SoftTerm::DeadlineExceeded => RpcError::DeadlineExceeded,
        }
    }
}

/// Returns true if a socket error on a connectionless transport should be
/// swallowed: the call stays pending and the timer will retransmit.
pub(crate) fn is_transient_io_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}
