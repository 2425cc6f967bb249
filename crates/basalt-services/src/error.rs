//! Failure taxonomy for data-transfer operations.
//!
//! Every handler returns `TransferError`; the connection dispatcher maps it
//! onto a wire `Status` when the connection can still carry a response.

use std::future::Future;
use std::time::Duration;

use basalt_core::checksum::ChecksumMismatch;
use basalt_core::wire::{Status, WireError};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Malformed or inconsistent request.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Local storage failure.
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Mirror, proxy or segment target unreachable or failed.
    #[error("downstream {addr}: {reason}")]
    Downstream { addr: String, reason: String },

    #[error("timed out {0}")]
    TimedOut(&'static str),

    /// This side closed the connection after a protocol lapse by the peer.
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("data checksum error: {0}")]
    Checksum(#[from] ChecksumMismatch),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl TransferError {
    pub fn downstream(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        TransferError::Downstream {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Status reported to the peer for this failure.
    pub fn status(&self) -> Status {
        match self {
            TransferError::AccessDenied(_) => Status::ErrorAccessToken,
            TransferError::Unsupported(_) => Status::ErrorUnsupported,
            TransferError::Wire(WireError::UnknownOp(_)) => Status::ErrorUnsupported,
            _ => Status::Error,
        }
    }

    /// True when the peer went away; no response can be delivered.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransferError::Wire(e) => e.is_eof(),
            TransferError::TimedOut(_) | TransferError::Closed(_) => true,
            _ => false,
        }
    }
}

/// Run a socket operation under a deadline.
pub async fn timed<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, WireError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransferError::TimedOut(what)),
    }
}
