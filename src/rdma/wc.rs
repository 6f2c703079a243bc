use std::fmt;

use thiserror::Error;

use super::type_alias::*;

/// Opcode of a completion queue entry.
///
/// Values match `enum ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data.
    RecvRdmaImm = 129,
}

impl WcOpcode {
    /// Cast a raw `ibv_wc_opcode`. Error completions leave the opcode
    /// undefined, so unknown values yield `None` instead of panicking.
    pub fn from_raw(opcode: u32) -> Option<Self> {
        Some(match opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            _ => return None,
        })
    }
}

/// Status of a completion queue entry.
///
/// Values match `enum ibv_wc_status`. Messages follow [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// **Operation completed successfully:** the memory buffers of the work
    /// request are ready to be (re)used.
    #[error("success")]
    Success = 0,

    /// **Local Length Error:** a posted receive is not big enough for the
    /// incoming message, or a send exceeds the port's maximum message size.
    #[error("local length error")]
    LocLenErr = 1,

    /// **Local QP Operation Error:** an internal QP consistency error was
    /// detected while processing this work request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// **Local EE Context Operation Error:** only relevant to RD QPs.
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// **Local Protection Error:** the scatter/gather list does not reference
    /// a memory region that is valid for the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// **Work Request Flushed Error:** the work request was outstanding when
    /// the QP transitioned into the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// **Memory Window Binding Error.**
    #[error("memory window bind error")]
    MwBindErr = 6,

    /// **Bad Response Error:** an unexpected transport layer opcode was
    /// returned by the responder.
    #[error("bad response error")]
    BadRespErr = 7,

    /// **Local Access Error:** a protection error occurred on a local data
    /// buffer during an incoming RDMA Write with Immediate.
    #[error("local access error")]
    LocAccessErr = 8,

    /// **Remote Invalid Request Error:** the responder detected an invalid
    /// message, e.g. its receive buffer is too small or the operation is not
    /// permitted by its QP access flags.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// **Remote Access Error:** a protection error occurred on the remote
    /// buffer of an RDMA Read or Write.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// **Remote Operation Error:** the responder could not complete the
    /// operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// **Transport Retry Counter Exceeded:** the remote side sent no ACK or
    /// NAK. On the first message this usually means wrong connection
    /// attributes; later it means the remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// **RNR Retry Counter Exceeded:** the remote side did not post a receive
    /// in time.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// **Local RDD Violation Error:** only relevant to RD QPs.
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// **Remote Invalid RD Request Error:** only relevant to RD QPs.
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// **Remote Aborted Error.**
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// **Invalid EE Context Number:** only relevant to RD QPs.
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// **Invalid EE Context State Error:** only relevant to RD QPs.
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    /// **Fatal error.**
    #[error("fatal error")]
    FatalErr = 19,

    /// **Response Timeout Error.**
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// **General Error:** any error which isn't one of the above, including
    /// status codes this crate does not know.
    #[error("general error")]
    GeneralErr = 21,
}

impl From<u32> for WcStatus {
    fn from(wc_status: u32) -> Self {
        use WcStatus::*;
        const ALL: [WcStatus; 22] = [
            Success,
            LocLenErr,
            LocQpOpErr,
            LocEecOpErr,
            LocProtErr,
            WrFlushErr,
            MwBindErr,
            BadRespErr,
            LocAccessErr,
            RemInvReqErr,
            RemAccessErr,
            RemOpErr,
            RetryExcErr,
            RnrRetryExcErr,
            LocRddViolErr,
            RemInvRdReqErr,
            RemAbortErr,
            InvEecnErr,
            InvEecStateErr,
            FatalErr,
            RespTimeoutErr,
            GeneralErr,
        ];
        ALL.get(wc_status as usize).copied().unwrap_or(GeneralErr)
    }
}

/// Work completion entry, as reported by any provider.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    pub wr_id: WrId,
    pub status: WcStatus,
    /// `None` when the provider reported an opcode this crate does not know.
    pub opcode: Option<WcOpcode>,
    pub byte_len: u32,
    pub vendor_err: u32,
    pub qp_num: Qpn,
}

impl Wc {
    /// Get the completion status as a `Result`.
    ///
    /// - If the status is `Success`, return the number of bytes transferred.
    /// - Otherwise, return the status.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            status => Err(status),
        }
    }
}

impl Default for Wc {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: None,
            byte_len: 0,
            vendor_err: 0,
            qp_num: 0,
        }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &format_args!("{:#x}", self.wr_id))
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}
