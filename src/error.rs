use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::rdma::qp::QpState;
use crate::rdma::type_alias::WrId;
use crate::rdma::wc::WcStatus;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a data transfer failed.
#[derive(Debug, Error)]
pub enum TransferCause {
    /// The provider rejected the work request when it was posted.
    #[error("post rejected: {0}")]
    Post(#[source] io::Error),

    /// Polling the completion queue failed.
    #[error("completion queue poll failed: {0}")]
    Poll(#[source] io::Error),

    /// The work request completed with an error status.
    #[error("work request {wr_id:#x} completed with {status} (vendor error {vendor_err:#x})")]
    Completion {
        wr_id: WrId,
        status: WcStatus,
        vendor_err: u32,
    },
}

impl TransferCause {
    /// Get the completion status, if the failure was reported by a completion.
    pub fn status(&self) -> Option<WcStatus> {
        match self {
            TransferCause::Completion { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Communicator error type.
///
/// Each variant names the operation that failed.
#[derive(Debug, Error)]
pub enum Error {
    /// The RDMA device or port could not be opened or is unusable.
    #[error("{op}: device error: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A queue pair transition was requested in the wrong state.
    #[error("{op}: queue pair is in {actual:?}, expected {expected:?}")]
    State {
        op: &'static str,
        expected: QpState,
        actual: QpState,
    },

    /// The path to the peer cannot be resolved.
    #[error("{op}: cannot resolve peer address: {reason}")]
    Address { op: &'static str, reason: String },

    /// The provider refused to register the buffer.
    #[error("{op}: memory registration failed: {source}")]
    Registration {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The control stream failed.
    #[error("{op}: I/O error: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer closed the stream.
    #[error("{op}: connection closed by peer")]
    ConnectionClosed { op: &'static str },

    /// A data transfer failed.
    #[error("{op}: transfer failed: {cause}")]
    Transfer {
        op: &'static str,
        #[source]
        cause: TransferCause,
    },

    /// No completion arrived before the poll deadline.
    #[error("{op}: no completion within {waited:?}")]
    Timeout { op: &'static str, waited: Duration },

    /// The operation needs a buffer but none is set.
    #[error("{op}: no buffer is set")]
    NoBuffer { op: &'static str },

    /// The requested region does not fit in the buffer.
    #[error("{op}: region [{offset}, {offset} + {len}) exceeds buffer of {extent} bytes")]
    OutOfBounds {
        op: &'static str,
        offset: usize,
        len: usize,
        extent: usize,
    },

    /// The message is larger than a single provider operation allows.
    #[error("{op}: {len} bytes exceed the single-message limit of {limit} bytes")]
    MessageTooLarge {
        op: &'static str,
        len: usize,
        limit: usize,
    },

    /// `recv` was called with no receive posted.
    #[error("{op}: no receive is posted")]
    NoPendingReceive { op: &'static str },

    /// `recv` names a region other than the oldest posted receive.
    #[error("{op}: oldest posted receive is ({posted_offset}, {posted_len}), got ({offset}, {len})")]
    ReceiveMismatch {
        op: &'static str,
        posted_offset: usize,
        posted_len: usize,
        offset: usize,
        len: usize,
    },

    /// The buffer cannot be replaced while receives target it.
    #[error("{op}: {pending} receive(s) still target the current buffer")]
    BufferBusy { op: &'static str, pending: usize },

    /// No peer descriptor has been exchanged yet.
    #[error("{op}: no peer descriptor has been exchanged")]
    NoPeer { op: &'static str },

    /// The peer did not grant one-sided access to its buffer.
    #[error("{op}: peer did not grant remote access")]
    RemoteAccessDenied { op: &'static str },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Map a control-stream error, folding peer-close conditions into
    /// [`Error::ConnectionClosed`].
    pub(crate) fn from_stream(op: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Error::ConnectionClosed { op },
            _ => Error::Io { op, source },
        }
    }

    pub(crate) fn device(op: &'static str, source: io::Error) -> Self {
        Error::Device { op, source }
    }

    pub(crate) fn transfer(op: &'static str, cause: TransferCause) -> Self {
        Error::Transfer { op, cause }
    }

    /// Get the completion status carried by a transfer error.
    pub fn wc_status(&self) -> Option<WcStatus> {
        match self {
            Error::Transfer { cause, .. } => cause.status(),
            _ => None,
        }
    }

    /// Check whether the peer has gone away.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_close_kinds_fold_into_connection_closed() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
        ] {
            let err = Error::from_stream("exchange_descriptor", io::Error::from(kind));
            assert!(err.is_connection_closed(), "{:?} not folded", kind);
        }

        let err = Error::from_stream("exchange_descriptor", io::Error::from(io::ErrorKind::Other));
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn messages_name_the_operation() {
        let err = Error::transfer(
            "recv",
            TransferCause::Completion {
                wr_id: 0x8000_0000_0000_0001,
                status: WcStatus::LocLenErr,
                vendor_err: 0,
            },
        );
        let msg = err.to_string();
        assert!(msg.starts_with("recv:"));
        assert!(msg.contains("local length error"));
        assert_eq!(err.wc_status(), Some(WcStatus::LocLenErr));
    }
}
