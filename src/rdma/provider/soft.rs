//! An in-process RDMA fabric.
//!
//! Every [`SoftFabric`] clone shares one set of devices, queue pairs and
//! memory regions. Transfers really copy bytes between registered buffers, and
//! the reliable-connected rules are enforced:
//!
//! - queue pair transitions must follow RESET, INIT, RTR, RTS;
//! - a SEND with no posted receive waits for one, as an RNR retry count of 7 would;
//! - a receive shorter than the incoming message fails with a local length
//!   error on the receiver and a remote invalid request error on the sender;
//! - scatter/gather entries are checked against their lkey's region;
//! - a one-sided operation is checked against the target region's rkey, its
//!   permissions, and the target queue pair's access flags;
//! - a failed completion moves the queue pair to ERR, which flushes the work
//!   requests still queued on it.
//!
//! Each device has one RoCE port (number 1) whose GID table holds a link-local
//! address at index 0 and an IPv4-mapped address at index 1.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::*;
use crate::rdma::port::{PortLinkLayer, PortState};
use crate::rdma::wc::{WcOpcode, WcStatus};

/// Port number of the only port on a software device.
const PORT_NUM: PortNum = 1;

/// Largest message a single work request may carry.
const MAX_MSG_SZ: u32 = 1 << 30;

/// Active MTU of every software port.
const ACTIVE_MTU: PortMtu = PortMtu::Mtu1024;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct SoftDevice {
    name: String,
    port_state: PortState,
    gids: [Gid; 2],
}

impl SoftDevice {
    fn new(name: &str, idx: usize) -> Self {
        let host = idx as u16 + 1;
        Self {
            name: name.to_owned(),
            port_state: PortState::Active,
            gids: [
                Gid::from(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, host)),
                Gid::from(Ipv4Addr::new(10, 0, (host >> 8) as u8, host as u8)),
            ],
        }
    }
}

/// Completion entries shared between the fabric and a [`SoftCq`].
struct CqShared {
    capacity: u32,
    entries: Mutex<VecDeque<Wc>>,
}

impl CqShared {
    fn push(&self, wc: Wc) {
        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity as usize {
            log::warn!("soft CQ overrun: {} entries pending", entries.len());
        }
        entries.push_back(wc);
    }
}

/// A SEND that reached its target but has not been matched with a receive.
struct Inbound {
    src_qpn: Qpn,
    wr_id: WrId,
    signaled: bool,
    data: Vec<u8>,
}

struct QpSlot {
    device: usize,
    caps: QpCaps,
    cq: Arc<CqShared>,
    state: QpState,
    access: Permission,
    dest: Option<(usize, Qpn)>,
    recvs: VecDeque<RecvWr>,
    inbound: VecDeque<Inbound>,
    sends_in_flight: u32,
    modify_calls: usize,
    post_calls: usize,
}

struct MrSlot {
    device: usize,
    addr: usize,
    len: usize,
    perm: Permission,
    lkey: LKey,
    rkey: RKey,
}

impl MrSlot {
    fn covers(&self, addr: u64, len: u32) -> bool {
        let start = self.addr as u64;
        let end = start + self.len as u64;
        addr >= start && addr.checked_add(len as u64).is_some_and(|e| e <= end)
    }
}

#[derive(Default)]
struct Fabric {
    devices: Vec<SoftDevice>,
    qps: HashMap<Qpn, QpSlot>,
    mrs: HashMap<u64, MrSlot>,
    next_qpn: Qpn,
    next_mr: u64,
}

impl Fabric {
    fn device_by_gid(&self, gid: &Gid) -> Option<usize> {
        self.devices.iter().position(|d| d.gids.contains(gid))
    }

    /// Find a local region usable through `sge` on `device`.
    fn local_mr(&self, device: usize, sge: &Sge) -> Option<&MrSlot> {
        self.mrs
            .values()
            .find(|mr| mr.device == device && mr.lkey == sge.lkey && mr.covers(sge.addr, sge.length))
    }

    /// Find a remote region usable through `rkey` on `device`.
    fn remote_mr(&self, device: usize, rkey: RKey, addr: u64, len: u32) -> Option<&MrSlot> {
        self.mrs
            .values()
            .find(|mr| mr.device == device && mr.rkey == rkey && mr.covers(addr, len))
    }

    fn complete(&mut self, qpn: Qpn, wc: Wc) {
        if let Some(qp) = self.qps.get(&qpn) {
            log::trace!("soft QP {:#x}: {:?}", qpn, wc);
            qp.cq.push(wc);
        }
    }

    fn complete_send(&mut self, qpn: Qpn, wr_id: WrId, signaled: bool, status: WcStatus, op: WcOpcode, len: u32) {
        if let Some(qp) = self.qps.get_mut(&qpn) {
            qp.sends_in_flight = qp.sends_in_flight.saturating_sub(1);
        }
        if signaled || status != WcStatus::Success {
            self.complete(
                qpn,
                Wc {
                    wr_id,
                    status,
                    opcode: Some(op),
                    byte_len: len,
                    vendor_err: 0,
                    qp_num: qpn,
                },
            );
        }
        if status != WcStatus::Success {
            self.fail(qpn);
        }
    }

    /// Move a queue pair to ERR and flush what is queued on it.
    fn fail(&mut self, qpn: Qpn) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            return;
        };
        if qp.state == QpState::Error {
            return;
        }
        log::debug!("soft QP {:#x}: {:?} -> Error", qpn, qp.state);
        qp.state = QpState::Error;

        let recvs = qp.recvs.drain(..).collect::<Vec<_>>();
        let inbound = qp.inbound.drain(..).collect::<Vec<_>>();
        for wr in recvs {
            self.complete(qpn, flushed(wr.wr_id, qpn, WcOpcode::Recv));
        }

        // Senders whose messages were waiting here never get an ACK.
        for msg in inbound {
            self.complete_send(msg.src_qpn, msg.wr_id, msg.signaled, WcStatus::RetryExcErr, WcOpcode::Send, 0);
        }
    }

    /// Match parked SENDs with posted receives on `qpn`.
    fn deliver(&mut self, qpn: Qpn) {
        loop {
            let Some(qp) = self.qps.get_mut(&qpn) else {
                return;
            };
            if qp.recvs.is_empty() || qp.inbound.is_empty() {
                return;
            }
            let (Some(wr), Some(msg)) = (qp.recvs.pop_front(), qp.inbound.pop_front()) else {
                return;
            };
            let device = qp.device;

            let status = match self.local_mr(device, &wr.sge) {
                Some(mr) if mr.perm.contains(Permission::LOCAL_WRITE) => {
                    if msg.data.len() > wr.sge.length as usize {
                        Err((WcStatus::LocLenErr, WcStatus::RemInvReqErr))
                    } else {
                        // SAFETY: the region is registered and covers the
                        // destination range; registration keeps it alive.
                        unsafe {
                            ptr::copy(msg.data.as_ptr(), wr.sge.addr as *mut u8, msg.data.len())
                        };
                        Ok(msg.data.len() as u32)
                    }
                }
                _ => Err((WcStatus::LocProtErr, WcStatus::RemOpErr)),
            };

            match status {
                Ok(len) => {
                    self.complete(
                        qpn,
                        Wc {
                            wr_id: wr.wr_id,
                            status: WcStatus::Success,
                            opcode: Some(WcOpcode::Recv),
                            byte_len: len,
                            vendor_err: 0,
                            qp_num: qpn,
                        },
                    );
                    self.complete_send(msg.src_qpn, msg.wr_id, msg.signaled, WcStatus::Success, WcOpcode::Send, len);
                }
                Err((local, remote)) => {
                    self.complete(
                        qpn,
                        Wc {
                            wr_id: wr.wr_id,
                            status: local,
                            opcode: Some(WcOpcode::Recv),
                            byte_len: 0,
                            vendor_err: 0,
                            qp_num: qpn,
                        },
                    );
                    self.fail(qpn);
                    self.complete_send(msg.src_qpn, msg.wr_id, msg.signaled, remote, WcOpcode::Send, 0);
                }
            }
        }
    }

    /// Resolve the connected target of `qpn`, if it can still respond.
    fn target(&self, qpn: Qpn) -> Option<(usize, Qpn)> {
        let (device, dest_qpn) = self.qps.get(&qpn)?.dest?;
        let dest = self.qps.get(&dest_qpn)?;
        // A peer still short of RTR would be retried until it gets there.
        let responsive =
            dest.device == device && matches!(dest.state, QpState::Init | QpState::Rtr | QpState::Rts);
        responsive.then_some((device, dest_qpn))
    }

    fn post_send(&mut self, qpn: Qpn, wr: &SendWr) -> io::Result<()> {
        let qp = self.qps.get_mut(&qpn).ok_or_else(|| errno(libc::EINVAL))?;
        qp.post_calls += 1;

        let op = match wr.op {
            SendOp::Send => WcOpcode::Send,
            SendOp::Write { .. } => WcOpcode::RdmaWrite,
            SendOp::Read { .. } => WcOpcode::RdmaRead,
        };
        match qp.state {
            QpState::Rts => {}
            QpState::Error => {
                let wc = flushed(wr.wr_id, qpn, op);
                qp.cq.push(wc);
                return Ok(());
            }
            _ => return Err(errno(libc::EINVAL)),
        }
        if qp.sends_in_flight >= qp.caps.max_send_wr {
            return Err(errno(libc::ENOMEM));
        }
        qp.sends_in_flight += 1;
        let device = qp.device;

        if wr.sge.length > MAX_MSG_SZ {
            self.complete_send(qpn, wr.wr_id, wr.signaled, WcStatus::LocLenErr, op, 0);
            return Ok(());
        }
        let Some(local) = self.local_mr(device, &wr.sge) else {
            self.complete_send(qpn, wr.wr_id, wr.signaled, WcStatus::LocProtErr, op, 0);
            return Ok(());
        };
        if matches!(wr.op, SendOp::Read { .. }) && !local.perm.contains(Permission::LOCAL_WRITE) {
            self.complete_send(qpn, wr.wr_id, wr.signaled, WcStatus::LocProtErr, op, 0);
            return Ok(());
        }
        let Some((dest_device, dest_qpn)) = self.target(qpn) else {
            self.complete_send(qpn, wr.wr_id, wr.signaled, WcStatus::RetryExcErr, op, 0);
            return Ok(());
        };

        let len = wr.sge.length;
        match wr.op {
            SendOp::Send => {
                let mut data = vec![0u8; len as usize];
                // SAFETY: the local region covers the source range.
                unsafe { ptr::copy(wr.sge.addr as *const u8, data.as_mut_ptr(), len as usize) };

                if let Some(dest) = self.qps.get_mut(&dest_qpn) {
                    dest.inbound.push_back(Inbound {
                        src_qpn: qpn,
                        wr_id: wr.wr_id,
                        signaled: wr.signaled,
                        data,
                    });
                }
                self.deliver(dest_qpn);
            }
            SendOp::Write { remote_addr, rkey } | SendOp::Read { remote_addr, rkey } => {
                let (need, writing) = match wr.op {
                    SendOp::Write { .. } => (Permission::REMOTE_WRITE, true),
                    _ => (Permission::REMOTE_READ, false),
                };
                let dest_access = self.qps.get(&dest_qpn).map(|q| q.access).unwrap_or(Permission::EMPTY);
                let allowed = dest_access.contains(need)
                    && self
                        .remote_mr(dest_device, rkey, remote_addr, len)
                        .is_some_and(|mr| mr.perm.contains(need));
                if !allowed {
                    self.complete_send(qpn, wr.wr_id, wr.signaled, WcStatus::RemAccessErr, op, 0);
                    return Ok(());
                }

                let (src, dst) = if writing {
                    (wr.sge.addr, remote_addr)
                } else {
                    (remote_addr, wr.sge.addr)
                };
                // SAFETY: both ranges were checked against registered regions.
                unsafe { ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
                self.complete_send(qpn, wr.wr_id, wr.signaled, WcStatus::Success, op, len);
            }
        }
        Ok(())
    }

    fn post_recv(&mut self, qpn: Qpn, wr: &RecvWr) -> io::Result<()> {
        let qp = self.qps.get_mut(&qpn).ok_or_else(|| errno(libc::EINVAL))?;
        qp.post_calls += 1;

        match qp.state {
            QpState::Reset => return Err(errno(libc::EINVAL)),
            QpState::Error => {
                let wc = flushed(wr.wr_id, qpn, WcOpcode::Recv);
                qp.cq.push(wc);
                return Ok(());
            }
            _ => {}
        }
        if qp.recvs.len() >= qp.caps.max_recv_wr as usize {
            return Err(errno(libc::ENOMEM));
        }
        qp.recvs.push_back(*wr);
        self.deliver(qpn);
        Ok(())
    }

    fn modify(&mut self, qpn: Qpn, transition: &QpTransition) -> io::Result<()> {
        let resolved = match transition {
            QpTransition::Rtr(attr) => self.device_by_gid(&attr.dgid),
            _ => None,
        };

        let qp = self.qps.get_mut(&qpn).ok_or_else(|| errno(libc::EINVAL))?;
        qp.modify_calls += 1;

        let expected = match transition {
            QpTransition::Init { .. } => QpState::Reset,
            QpTransition::Rtr(_) => QpState::Init,
            QpTransition::Rts(_) => QpState::Rtr,
        };
        if qp.state != expected {
            return Err(errno(libc::EINVAL));
        }

        match transition {
            QpTransition::Init { port_num, access } => {
                if *port_num != PORT_NUM {
                    return Err(errno(libc::EINVAL));
                }
                qp.access = *access;
            }
            QpTransition::Rtr(attr) => {
                if attr.port_num != PORT_NUM || attr.sgid_index as usize >= 2 {
                    return Err(errno(libc::EINVAL));
                }
                if attr.path_mtu > ACTIVE_MTU {
                    return Err(errno(libc::EINVAL));
                }
                let device = resolved.ok_or_else(|| errno(libc::EHOSTUNREACH))?;
                qp.dest = Some((device, attr.dest_qpn));
            }
            QpTransition::Rts(attr) => {
                if attr.retry_cnt > 7 || attr.rnr_retry > 7 {
                    return Err(errno(libc::EINVAL));
                }
            }
        }

        log::debug!("soft QP {:#x}: {:?} -> {:?}", qpn, qp.state, transition.target());
        qp.state = transition.target();
        Ok(())
    }

    fn destroy_qp(&mut self, qpn: Qpn) {
        let Some(slot) = self.qps.remove(&qpn) else {
            return;
        };

        // Peers that were waiting on this queue pair time out.
        for msg in slot.inbound {
            self.complete_send(msg.src_qpn, msg.wr_id, msg.signaled, WcStatus::RetryExcErr, WcOpcode::Send, 0);
        }
        for qp in self.qps.values_mut() {
            qp.inbound.retain(|msg| msg.src_qpn != qpn);
        }
    }
}

fn flushed(wr_id: WrId, qpn: Qpn, op: WcOpcode) -> Wc {
    Wc {
        wr_id,
        status: WcStatus::WrFlushErr,
        opcode: Some(op),
        byte_len: 0,
        vendor_err: 0,
        qp_num: qpn,
    }
}

/// An in-process RDMA fabric. Clones share state.
#[derive(Clone, Default)]
pub struct SoftFabric {
    inner: Arc<Mutex<Fabric>>,
}

impl SoftFabric {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fabric with the given devices, all ports active.
    pub fn with_devices(names: &[&str]) -> Self {
        let fabric = Self::new();
        for name in names {
            fabric.add_device(name);
        }
        fabric
    }

    /// Add a device with an active port. Returns `false` if the name is taken.
    pub fn add_device(&self, name: &str) -> bool {
        let mut fabric = lock(&self.inner);
        if fabric.devices.iter().any(|d| d.name == name) {
            return false;
        }
        let idx = fabric.devices.len();
        fabric.devices.push(SoftDevice::new(name, idx));
        true
    }

    /// Change the port state of a device. Contexts opened later observe it.
    pub fn set_port_state(&self, device: &str, state: PortState) -> bool {
        let mut fabric = lock(&self.inner);
        match fabric.devices.iter_mut().find(|d| d.name == device) {
            Some(d) => {
                d.port_state = state;
                true
            }
            None => false,
        }
    }

    /// Get a GID table entry of a device.
    pub fn gid(&self, device: &str, gid_index: GidIndex) -> Option<Gid> {
        let fabric = lock(&self.inner);
        let d = fabric.devices.iter().find(|d| d.name == device)?;
        d.gids.get(gid_index as usize).copied()
    }

    /// Get the current state of a queue pair.
    pub fn qp_state(&self, qpn: Qpn) -> Option<QpState> {
        lock(&self.inner).qps.get(&qpn).map(|qp| qp.state)
    }

    /// Count the modify calls issued on a queue pair, successful or not.
    pub fn modify_calls(&self, qpn: Qpn) -> Option<usize> {
        lock(&self.inner).qps.get(&qpn).map(|qp| qp.modify_calls)
    }

    /// Count the send and receive posts issued on a queue pair.
    pub fn post_calls(&self, qpn: Qpn) -> Option<usize> {
        lock(&self.inner).qps.get(&qpn).map(|qp| qp.post_calls)
    }

    /// Count the live memory regions on the fabric.
    pub fn registered_regions(&self) -> usize {
        lock(&self.inner).mrs.len()
    }
}

impl Provider for SoftFabric {
    fn device_names(&self) -> io::Result<Vec<String>> {
        Ok(lock(&self.inner).devices.iter().map(|d| d.name.clone()).collect())
    }

    fn open(
        &self,
        device: &str,
        port_num: PortNum,
        gid_index: GidIndex,
    ) -> io::Result<Box<dyn DeviceContext>> {
        let fabric = lock(&self.inner);
        let (idx, dev) = fabric
            .devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.name == device)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no device named {}", device))
            })?;
        if port_num != PORT_NUM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no port {}", device, port_num),
            ));
        }
        let gid = *dev.gids.get(gid_index as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("GID index {} out of range on {}", gid_index, device),
            )
        })?;

        let port = PortInfo {
            num: PORT_NUM,
            state: dev.port_state,
            lid: 0,
            link_layer: PortLinkLayer::Ethernet,
            active_mtu: ACTIVE_MTU,
            max_msg_sz: MAX_MSG_SZ,
            gid,
            gid_index,
        };
        Ok(Box::new(SoftContext {
            fabric: self.inner.clone(),
            device: idx,
            name: dev.name.clone(),
            port,
        }))
    }
}

/// A device opened on a [`SoftFabric`].
struct SoftContext {
    fabric: Arc<Mutex<Fabric>>,
    device: usize,
    name: String,
    port: PortInfo,
}

impl DeviceContext for SoftContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> &PortInfo {
        &self.port
    }

    fn create_qp(
        &self,
        caps: &QpCaps,
    ) -> io::Result<(Box<dyn CompletionQueue>, Box<dyn QueuePair>)> {
        if caps.cq_depth == 0
            || caps.max_send_wr == 0
            || caps.max_recv_wr == 0
            || caps.max_send_sge != 1
            || caps.max_recv_sge != 1
        {
            return Err(errno(libc::EINVAL));
        }

        let cq = Arc::new(CqShared {
            capacity: caps.cq_depth,
            entries: Mutex::new(VecDeque::new()),
        });

        let mut fabric = lock(&self.fabric);
        fabric.next_qpn += 1;
        let qpn = 0x100 + fabric.next_qpn;
        fabric.qps.insert(
            qpn,
            QpSlot {
                device: self.device,
                caps: *caps,
                cq: cq.clone(),
                state: QpState::Reset,
                access: Permission::EMPTY,
                dest: None,
                recvs: VecDeque::new(),
                inbound: VecDeque::new(),
                sends_in_flight: 0,
                modify_calls: 0,
                post_calls: 0,
            },
        );

        Ok((
            Box::new(SoftCq { shared: cq }),
            Box::new(SoftQp {
                fabric: self.fabric.clone(),
                qpn,
            }),
        ))
    }

    unsafe fn reg_mr(
        &self,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Box<dyn MemoryRegion>> {
        if addr.is_null() || len == 0 {
            return Err(errno(libc::EINVAL));
        }

        let mut fabric = lock(&self.fabric);
        fabric.next_mr += 1;
        let id = fabric.next_mr;
        let slot = MrSlot {
            device: self.device,
            addr: addr as usize,
            len,
            perm,
            lkey: 0x1000 + (id as u32) * 2,
            rkey: 0x1000 + (id as u32) * 2 + 1,
        };
        let (lkey, rkey) = (slot.lkey, slot.rkey);
        fabric.mrs.insert(id, slot);

        Ok(Box::new(SoftMr {
            fabric: self.fabric.clone(),
            id,
            addr,
            len,
            lkey,
            rkey,
        }))
    }
}

struct SoftCq {
    shared: Arc<CqShared>,
}

impl CompletionQueue for SoftCq {
    fn capacity(&self) -> u32 {
        self.shared.capacity
    }

    fn poll(&self, wc: &mut [Wc]) -> io::Result<usize> {
        let mut entries = lock(&self.shared.entries);
        let n = wc.len().min(entries.len());
        for (slot, entry) in wc.iter_mut().zip(entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }
}

struct SoftQp {
    fabric: Arc<Mutex<Fabric>>,
    qpn: Qpn,
}

impl QueuePair for SoftQp {
    fn qp_num(&self) -> Qpn {
        self.qpn
    }

    fn modify(&self, transition: &QpTransition) -> io::Result<()> {
        lock(&self.fabric).modify(self.qpn, transition)
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        lock(&self.fabric).post_send(self.qpn, wr)
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        lock(&self.fabric).post_recv(self.qpn, wr)
    }
}

impl Drop for SoftQp {
    fn drop(&mut self) {
        lock(&self.fabric).destroy_qp(self.qpn);
    }
}

struct SoftMr {
    fabric: Arc<Mutex<Fabric>>,
    id: u64,
    addr: *mut u8,
    len: usize,
    lkey: LKey,
    rkey: RKey,
}

// SAFETY: the address is only handed out, never dereferenced, by this type.
unsafe impl Send for SoftMr {}

impl MemoryRegion for SoftMr {
    fn addr(&self) -> *mut u8 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> LKey {
        self.lkey
    }

    fn rkey(&self) -> RKey {
        self.rkey
    }
}

impl Drop for SoftMr {
    fn drop(&mut self) {
        lock(&self.fabric).mrs.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::port::PortMtu;

    const CAPS: QpCaps = QpCaps {
        cq_depth: 16,
        max_send_wr: 8,
        max_recv_wr: 8,
        max_send_sge: 1,
        max_recv_sge: 1,
    };

    fn rtr(fabric: &SoftFabric, peer_dev: &str, dest_qpn: Qpn) -> QpTransition {
        QpTransition::Rtr(RtrAttr {
            port_num: 1,
            path_mtu: PortMtu::Mtu1024,
            dest_qpn,
            rq_psn: 0,
            dgid: fabric.gid(peer_dev, 0).unwrap(),
            sgid_index: 0,
            hop_limit: 0xFF,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
        })
    }

    const RTS: QpTransition = QpTransition::Rts(RtsAttr {
        sq_psn: 0,
        timeout: 14,
        retry_cnt: 7,
        rnr_retry: 7,
        max_rd_atomic: 1,
    });

    struct End {
        _ctx: Box<dyn DeviceContext>,
        cq: Box<dyn CompletionQueue>,
        qp: Box<dyn QueuePair>,
    }

    fn pair(fabric: &SoftFabric) -> (End, End) {
        let open = |name: &str| {
            let ctx = fabric.open(name, 1, 0).unwrap();
            let (cq, qp) = ctx.create_qp(&CAPS).unwrap();
            End { _ctx: ctx, cq, qp }
        };
        let (a, b) = (open("soft_0"), open("soft_1"));
        let init = QpTransition::Init {
            port_num: 1,
            access: Permission::default(),
        };
        for (x, peer, y) in [(&a, "soft_1", &b), (&b, "soft_0", &a)] {
            x.qp.modify(&init).unwrap();
            x.qp.modify(&rtr(fabric, peer, y.qp.qp_num())).unwrap();
            x.qp.modify(&RTS).unwrap();
        }
        (a, b)
    }

    fn poll_one(cq: &dyn CompletionQueue) -> Option<Wc> {
        let mut wc = [Wc::default()];
        (cq.poll(&mut wc).unwrap() == 1).then_some(wc[0])
    }

    #[test]
    fn transitions_follow_order() {
        let fabric = SoftFabric::with_devices(&["soft_0"]);
        let ctx = fabric.open("soft_0", 1, 0).unwrap();
        let (_cq, qp) = ctx.create_qp(&CAPS).unwrap();

        assert!(qp.modify(&RTS).is_err());
        assert_eq!(fabric.qp_state(qp.qp_num()), Some(QpState::Reset));
        assert_eq!(fabric.modify_calls(qp.qp_num()), Some(1));
    }

    #[test]
    fn open_rejects_bad_port_and_gid() {
        let fabric = SoftFabric::with_devices(&["soft_0"]);
        assert_eq!(
            fabric.open("nope", 1, 0).err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
        assert!(fabric.open("soft_0", 2, 0).is_err());
        assert!(fabric.open("soft_0", 1, 2).is_err());
        assert_eq!(fabric.open("soft_0", 1, 1).unwrap().port().gid_index, 1);
    }

    #[test]
    fn send_waits_for_receive() {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (a, b) = pair(&fabric);

        let mut src = *b"ping";
        let mut dst = [0u8; 16];
        let src_mr = unsafe { a._ctx.reg_mr(src.as_mut_ptr(), 4, Permission::default()) }.unwrap();
        let dst_mr = unsafe { b._ctx.reg_mr(dst.as_mut_ptr(), 16, Permission::default()) }.unwrap();

        a.qp.post_send(&SendWr {
            wr_id: 7,
            sge: Sge {
                addr: src.as_ptr() as u64,
                length: 4,
                lkey: src_mr.lkey(),
            },
            op: SendOp::Send,
            signaled: true,
        })
        .unwrap();
        assert!(poll_one(a.cq.as_ref()).is_none());

        b.qp.post_recv(&RecvWr {
            wr_id: 9,
            sge: Sge {
                addr: dst.as_ptr() as u64,
                length: 16,
                lkey: dst_mr.lkey(),
            },
        })
        .unwrap();

        let recv = poll_one(b.cq.as_ref()).unwrap();
        assert_eq!((recv.wr_id, recv.ok()), (9, Ok(4)));
        let send = poll_one(a.cq.as_ref()).unwrap();
        assert_eq!((send.wr_id, send.status), (7, WcStatus::Success));
        assert_eq!(&dst[..4], b"ping");
    }

    #[test]
    fn short_receive_fails_both_sides() {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (a, b) = pair(&fabric);

        let mut src = [1u8; 32];
        let mut dst = [0u8; 8];
        let src_mr = unsafe { a._ctx.reg_mr(src.as_mut_ptr(), 32, Permission::default()) }.unwrap();
        let dst_mr = unsafe { b._ctx.reg_mr(dst.as_mut_ptr(), 8, Permission::default()) }.unwrap();

        b.qp.post_recv(&RecvWr {
            wr_id: 1,
            sge: Sge {
                addr: dst.as_ptr() as u64,
                length: 8,
                lkey: dst_mr.lkey(),
            },
        })
        .unwrap();
        a.qp.post_send(&SendWr {
            wr_id: 2,
            sge: Sge {
                addr: src.as_ptr() as u64,
                length: 32,
                lkey: src_mr.lkey(),
            },
            op: SendOp::Send,
            signaled: true,
        })
        .unwrap();

        assert_eq!(poll_one(b.cq.as_ref()).unwrap().status, WcStatus::LocLenErr);
        assert_eq!(poll_one(a.cq.as_ref()).unwrap().status, WcStatus::RemInvReqErr);
        assert_eq!(fabric.qp_state(a.qp.qp_num()), Some(QpState::Error));
        assert_eq!(fabric.qp_state(b.qp.qp_num()), Some(QpState::Error));
        assert_eq!(dst, [0u8; 8]);
    }

    #[test]
    fn write_checks_rkey() {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (a, b) = pair(&fabric);

        let mut src = *b"abcd";
        let mut dst = [0u8; 4];
        let src_mr = unsafe { a._ctx.reg_mr(src.as_mut_ptr(), 4, Permission::default()) }.unwrap();
        let dst_mr = unsafe { b._ctx.reg_mr(dst.as_mut_ptr(), 4, Permission::default()) }.unwrap();

        let write = |rkey| SendWr {
            wr_id: 3,
            sge: Sge {
                addr: src.as_ptr() as u64,
                length: 4,
                lkey: src_mr.lkey(),
            },
            op: SendOp::Write {
                remote_addr: dst.as_ptr() as u64,
                rkey,
            },
            signaled: true,
        };

        a.qp.post_send(&write(dst_mr.rkey())).unwrap();
        assert_eq!(poll_one(a.cq.as_ref()).unwrap().ok(), Ok(4));
        assert_eq!(&dst, b"abcd");

        a.qp.post_send(&write(dst_mr.rkey() + 100)).unwrap();
        assert_eq!(poll_one(a.cq.as_ref()).unwrap().status, WcStatus::RemAccessErr);

        // The queue pair is now in ERR; further posts are flushed.
        a.qp.post_send(&write(dst_mr.rkey())).unwrap();
        assert_eq!(poll_one(a.cq.as_ref()).unwrap().status, WcStatus::WrFlushErr);
    }

    #[test]
    fn regions_are_released_on_drop() {
        let fabric = SoftFabric::with_devices(&["soft_0"]);
        let ctx = fabric.open("soft_0", 1, 0).unwrap();
        let mut buf = [0u8; 8];
        let mr = unsafe { ctx.reg_mr(buf.as_mut_ptr(), 8, Permission::default()) }.unwrap();
        assert_eq!(fabric.registered_regions(), 1);
        drop(mr);
        assert_eq!(fabric.registered_regions(), 0);
        assert!(unsafe { ctx.reg_mr(buf.as_mut_ptr(), 0, Permission::default()) }.is_err());
    }
}
