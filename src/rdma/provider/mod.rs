//! The RDMA capability surface.
//!
//! A [`Provider`] opens devices; everything else hangs off the returned
//! [`DeviceContext`]. Handles release their resource on drop, and each one keeps
//! whatever it depends on alive, so they may be dropped in any order.
//!
//! Two providers exist: [`soft::SoftFabric`], an in-process fabric, and
//! `verbs::VerbsProvider` (feature `verbs`), backed by `libibverbs`.

use std::io;

use super::gid::Gid;
use super::perm::Permission;
use super::port::{PortInfo, PortMtu};
use super::qp::QpState;
use super::type_alias::*;
use super::wc::Wc;

pub mod soft;

#[cfg(feature = "verbs")]
pub mod verbs;

/// Queue pair and completion queue capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    /// Completion queue depth.
    pub cq_depth: u32,

    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,

    /// Maximum outstanding receive work requests.
    pub max_recv_wr: u32,

    /// Maximum scatter/gather entries per send work request.
    pub max_send_sge: u32,

    /// Maximum scatter/gather entries per receive work request.
    pub max_recv_sge: u32,
}

/// Attributes for the INIT to RTR transition.
#[derive(Debug, Clone, Copy)]
pub struct RtrAttr {
    pub port_num: PortNum,
    pub path_mtu: PortMtu,
    pub dest_qpn: Qpn,
    pub rq_psn: Psn,
    pub dgid: Gid,
    pub sgid_index: GidIndex,
    pub hop_limit: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
}

/// Attributes for the RTR to RTS transition.
#[derive(Debug, Clone, Copy)]
pub struct RtsAttr {
    pub sq_psn: Psn,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

/// One queue pair state transition, carried out by a single modify call.
#[derive(Debug, Clone, Copy)]
pub enum QpTransition {
    Init {
        port_num: PortNum,
        access: Permission,
    },
    Rtr(RtrAttr),
    Rts(RtsAttr),
}

impl QpTransition {
    /// The state the queue pair is in after the transition succeeds.
    pub fn target(&self) -> QpState {
        match self {
            QpTransition::Init { .. } => QpState::Init,
            QpTransition::Rtr(_) => QpState::Rtr,
            QpTransition::Rts(_) => QpState::Rts,
        }
    }
}

/// A scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Operation carried by a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    /// Two-sided send, consumed by a posted receive.
    Send,

    /// One-sided write into remote memory.
    Write { remote_addr: u64, rkey: RKey },

    /// One-sided read from remote memory.
    Read { remote_addr: u64, rkey: RKey },
}

/// A send work request with a single scatter/gather entry.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub wr_id: WrId,
    pub sge: Sge,
    pub op: SendOp,
    pub signaled: bool,
}

/// A receive work request with a single scatter/gather entry.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

/// Pick the device named `pattern`, or else the only device whose whole name
/// matches `pattern` as a regular expression.
pub fn find_device(provider: &dyn Provider, pattern: &str) -> io::Result<String> {
    let names = provider.device_names()?;
    if names.iter().any(|name| name == pattern) {
        return Ok(pattern.to_owned());
    }

    let re = regex::Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let matched = names.iter().filter(|name| re.is_match(name)).collect::<Vec<_>>();
    match matched.as_slice() {
        [name] => Ok((*name).clone()),
        [] => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no device matches {:?} (have {:?})", pattern, names),
        )),
        many => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{:?} matches several devices: {:?}", pattern, many),
        )),
    }
}

/// A source of RDMA devices.
pub trait Provider: Send + Sync {
    /// List the names of the devices this provider can open.
    fn device_names(&self) -> io::Result<Vec<String>>;

    /// Open a device, query the given port and GID entry, and allocate a
    /// protection domain.
    fn open(
        &self,
        device: &str,
        port_num: PortNum,
        gid_index: GidIndex,
    ) -> io::Result<Box<dyn DeviceContext>>;
}

/// An opened device with its protection domain.
pub trait DeviceContext: Send {
    /// Get the device name.
    fn name(&self) -> &str;

    /// Get the attributes of the bound port, as queried at open time.
    fn port(&self) -> &PortInfo;

    /// Create a completion queue and an RC queue pair that uses it for both
    /// directions. The queue pair starts in RESET.
    fn create_qp(
        &self,
        caps: &QpCaps,
    ) -> io::Result<(Box<dyn CompletionQueue>, Box<dyn QueuePair>)>;

    /// Register `len` bytes at `addr` in this context's protection domain.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not move, until the returned
    /// region is dropped. The provider may read or write it whenever a work
    /// request that references it is outstanding.
    unsafe fn reg_mr(
        &self,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Box<dyn MemoryRegion>>;
}

/// A completion queue.
pub trait CompletionQueue: Send {
    /// Get the number of entries the queue was created with.
    fn capacity(&self) -> u32;

    /// Non-blockingly poll up to `wc.len()` completions into `wc`, returning
    /// how many were filled.
    fn poll(&self, wc: &mut [Wc]) -> io::Result<usize>;
}

/// An RC queue pair.
pub trait QueuePair: Send {
    /// Get the queue pair number.
    fn qp_num(&self) -> Qpn;

    /// Apply one state transition.
    fn modify(&self, transition: &QpTransition) -> io::Result<()>;

    /// Post one send work request.
    fn post_send(&self, wr: &SendWr) -> io::Result<()>;

    /// Post one receive work request.
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;
}

/// A registered memory region.
pub trait MemoryRegion: Send {
    /// Get the start address.
    fn addr(&self) -> *mut u8;

    /// Get the length in bytes.
    fn len(&self) -> usize;

    /// Get the local key.
    fn lkey(&self) -> LKey;

    /// Get the remote key.
    fn rkey(&self) -> RKey;
}
