use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::config::CommConfig;
use crate::ctrl::{ControlChannel, Role};
use crate::error::{Error, Result, TransferCause};
use crate::rdma::mr::RegisteredBuffer;
use crate::rdma::poller::Poller;
use crate::rdma::port::{PortInfo, PortState};
use crate::rdma::provider::{self, DeviceContext, Provider, RecvWr, SendOp, SendWr, Sge};
use crate::rdma::qp::{Qp, QpParams, QpState};
use crate::rdma::type_alias::*;
use crate::rdma::wc::Wc;
use crate::rdma::wire::{self, WireMsg};

/// Work request ID tag of receives.
const RECV_TAG: WrId = 1 << 63;

/// Work request ID tag of one-sided operations.
const ONE_SIDED_TAG: WrId = 1 << 62;

#[derive(Debug, Clone, Copy)]
struct PendingRecv {
    wr_id: WrId,
    offset: usize,
    len: usize,
}

/// Two-sided messaging over an RDMA RC queue pair.
///
/// The control stream carries only the connection descriptors; data moves
/// through the queue pair. Every `send` and `recv` busy-polls until its own
/// completion arrives, so at most one send is outstanding at a time.
///
/// Receives complete in the order they were posted, and `recv` always names
/// the oldest one. A failed completion leaves the queue pair in
/// [`QpState::Error`]; it cannot carry traffic again.
pub struct RdmaCommunicator {
    // Field order is teardown order: the memory registration goes first and
    // the device context last.
    buffer: Option<RegisteredBuffer>,
    qp: Qp,
    poller: Poller,
    ctx: Box<dyn DeviceContext>,

    pending: VecDeque<PendingRecv>,
    peer: Option<WireMsg>,
    next_seq: u64,
    ctrl: ControlChannel,
    config: CommConfig,
}

impl RdmaCommunicator {
    /// Open `device` with default settings and create a queue pair on port 1.
    ///
    /// `device` is either an exact device name or a regular expression that
    /// matches exactly one device.
    pub fn new(
        ctrl: impl Into<ControlChannel>,
        provider: &dyn Provider,
        device: &str,
        gid_index: GidIndex,
    ) -> Result<Self> {
        Self::with_config(ctrl, provider, CommConfig::for_device(device, gid_index))
    }

    /// Open the configured device and create a queue pair in RESET.
    pub fn with_config(
        ctrl: impl Into<ControlChannel>,
        provider: &dyn Provider,
        config: CommConfig,
    ) -> Result<Self> {
        const OP: &str = "open_device";
        config.validate()?;

        let device =
            provider::find_device(provider, &config.device).map_err(|e| Error::device(OP, e))?;
        let ctx = provider
            .open(&device, config.port_num, config.gid_index)
            .map_err(|e| Error::device(OP, e))?;

        let port = ctx.port().clone();
        if port.state != PortState::Active {
            return Err(Error::device(
                OP,
                io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("port {} of {} is {:?}", port.num, device, port.state),
                ),
            ));
        }

        let (cq, qp) = ctx
            .create_qp(&config.qp_caps())
            .map_err(|e| Error::device("create_qp", e))?;
        let qp = Qp::new(qp, port, QpParams::from(&config));
        log::info!(
            "opened {} port {} (GID {} at index {}), QP {:#x}",
            device,
            qp.port().num,
            qp.port().gid,
            qp.port().gid_index,
            qp.qp_num()
        );

        Ok(Self {
            buffer: None,
            qp,
            poller: Poller::new(cq, config.poll_timeout()),
            ctx,
            pending: VecDeque::new(),
            peer: None,
            next_seq: 0,
            ctrl: ctrl.into(),
            config,
        })
    }

    /// Get the name of the opened device.
    #[inline]
    pub fn device_name(&self) -> &str {
        self.ctx.name()
    }

    /// Get the attributes of the bound port.
    #[inline]
    pub fn port(&self) -> &PortInfo {
        self.qp.port()
    }

    #[inline]
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp.qp_num()
    }

    #[inline]
    pub fn qp_state(&self) -> QpState {
        self.qp.state()
    }

    /// Get the descriptor received from the peer, if any.
    #[inline]
    pub fn peer(&self) -> Option<&WireMsg> {
        self.peer.as_ref()
    }

    /// Get the number of posted receives not yet collected by `recv`.
    #[inline]
    pub fn pending_receives(&self) -> usize {
        self.pending.len()
    }

    /// Get the largest message a single work request may carry.
    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.qp.port().max_msg_sz as usize
    }

    #[inline]
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poller.timeout()
    }

    /// Bound how long `send`, `recv` and the one-sided operations busy-poll.
    /// `None` waits forever.
    pub fn set_poll_timeout(&mut self, timeout: Option<Duration>) {
        self.poller.set_timeout(timeout);
    }

    /// Register `buf` and make it the communication buffer, handing back the
    /// previous one deregistered.
    ///
    /// Refused while receives are posted, since they target the current
    /// registration. A peer granted one-sided access to the previous buffer
    /// must be sent a fresh descriptor.
    pub fn set_buffer(&mut self, buf: Box<[u8]>) -> Result<Option<Box<[u8]>>> {
        self.ensure_idle("set_buffer")?;
        let registered = RegisteredBuffer::register(self.ctx.as_ref(), buf)?;
        Ok(self.buffer.replace(registered).map(RegisteredBuffer::into_inner))
    }

    /// Deregister the buffer and hand it back.
    pub fn take_buffer(&mut self) -> Result<Option<Box<[u8]>>> {
        self.ensure_idle("take_buffer")?;
        Ok(self.buffer.take().map(RegisteredBuffer::into_inner))
    }

    fn ensure_idle(&self, op: &'static str) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(Error::BufferBusy {
                op,
                pending: self.pending.len(),
            })
        }
    }

    #[inline]
    pub fn buffer(&self) -> Option<&[u8]> {
        self.buffer.as_ref().map(RegisteredBuffer::as_slice)
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.buffer.as_mut().map(RegisteredBuffer::as_mut_slice)
    }

    /// Build this side's descriptor. With `grant_remote_access` and a buffer
    /// set, the peer may read and write the whole buffer.
    pub fn local_descriptor(&self, grant_remote_access: bool) -> WireMsg {
        let msg = WireMsg::new(self.qp.qp_num(), self.qp.port().gid);
        match &self.buffer {
            Some(buf) if grant_remote_access => msg.with_remote(buf.remote()),
            _ => msg,
        }
    }

    /// Send `local` and receive the peer's descriptor. Both sides may call
    /// this at the same time.
    pub fn exchange_descriptor(&mut self, local: &WireMsg) -> Result<WireMsg> {
        let peer = wire::exchange(&mut self.ctrl, local)?;
        self.peer = Some(peer);
        Ok(peer)
    }

    /// Exchange descriptors with the client writing first.
    pub fn exchange_descriptor_ordered(&mut self, local: &WireMsg, role: Role) -> Result<WireMsg> {
        let peer = wire::exchange_ordered(&mut self.ctrl, local, role)?;
        self.peer = Some(peer);
        Ok(peer)
    }

    /// Modify the queue pair from RESET to INIT.
    pub fn to_init(&mut self) -> Result<()> {
        self.qp.to_init()
    }

    /// Modify the queue pair from INIT to RTR, targeting `peer`.
    pub fn to_rtr(&mut self, peer: &WireMsg) -> Result<()> {
        self.qp.to_rtr(peer)?;
        self.peer = Some(*peer);
        Ok(())
    }

    /// Modify the queue pair from RTR to RTS. `local` is the descriptor this
    /// side sent.
    pub fn to_rts(&mut self, local: &WireMsg) -> Result<()> {
        self.qp.to_rts(local)
    }

    /// Connect to the peer: exchange descriptors in role order and walk the
    /// queue pair up to RTS. Returns the peer's descriptor.
    ///
    /// The queue pair may already be in INIT, so that receives can be posted
    /// before the peer starts sending.
    pub fn establish(&mut self, role: Role, grant_remote_access: bool) -> Result<WireMsg> {
        if self.qp.state() == QpState::Reset {
            self.qp.to_init()?;
        }
        self.qp.expect_state("establish", QpState::Init)?;

        let local = self.local_descriptor(grant_remote_access);
        let peer = self.exchange_descriptor_ordered(&local, role)?;
        self.qp.to_rtr(&peer)?;
        self.qp.to_rts(&local)?;
        log::info!(
            "QP {:#x} connected to QP {:#x} at {}",
            self.qp.qp_num(),
            peer.qpn,
            peer.gid
        );
        Ok(peer)
    }

    fn next_wr_id(&mut self, tag: WrId) -> WrId {
        self.next_seq += 1;
        tag | (self.next_seq & !(RECV_TAG | ONE_SIDED_TAG))
    }

    /// Bounds-check a region of the buffer and describe it for the provider.
    fn local_sge(&self, op: &'static str, len: usize, offset: usize) -> Result<Sge> {
        let buf = self.buffer.as_ref().ok_or(Error::NoBuffer { op })?;
        buf.check_bounds(op, len, offset)?;
        let limit = self.max_message_size().min(u32::MAX as usize);
        if len > limit {
            return Err(Error::MessageTooLarge { op, len, limit });
        }
        Ok(buf.sge(len, offset))
    }

    /// Wait for `wr_id` and turn an error status into [`Error::Transfer`].
    fn complete(&mut self, op: &'static str, wr_id: WrId) -> Result<Wc> {
        let wc = self.poller.wait(op, wr_id)?;
        if let Err(status) = wc.ok() {
            self.qp.mark_failed();
            return Err(Error::transfer(
                op,
                TransferCause::Completion {
                    wr_id,
                    status,
                    vendor_err: wc.vendor_err,
                },
            ));
        }
        Ok(wc)
    }

    /// Post one send work request and wait for it. A timed-out request is
    /// abandoned.
    fn post_and_wait(&mut self, op: &'static str, wr: SendWr) -> Result<Wc> {
        self.qp
            .raw()
            .post_send(&wr)
            .map_err(|e| Error::transfer(op, TransferCause::Post(e)))?;
        log::trace!("posted {:?}", wr);

        match self.complete(op, wr.wr_id) {
            Err(e @ Error::Timeout { .. }) => {
                self.poller.abandon(wr.wr_id);
                Err(e)
            }
            other => other,
        }
    }

    /// Post a receive of `len` bytes into the buffer at `offset`.
    ///
    /// The queue pair must be at least in INIT. Receives are consumed by the
    /// peer's sends in the order they were posted.
    pub fn post_receive(&mut self, len: usize, offset: usize) -> Result<()> {
        const OP: &str = "post_receive";
        let sge = self.local_sge(OP, len, offset)?;
        match self.qp.state() {
            QpState::Init | QpState::Rtr | QpState::Rts => {}
            actual => {
                return Err(Error::State {
                    op: OP,
                    expected: QpState::Init,
                    actual,
                })
            }
        }

        let wr_id = self.next_wr_id(RECV_TAG);
        self.qp
            .raw()
            .post_recv(&RecvWr { wr_id, sge })
            .map_err(|e| Error::transfer(OP, TransferCause::Post(e)))?;
        self.pending.push_back(PendingRecv { wr_id, offset, len });
        log::trace!("posted receive {:#x}: {} bytes at offset {}", wr_id, len, offset);
        Ok(())
    }

    /// Send `len` bytes starting at `offset` and wait until the peer has
    /// acknowledged them. Returns `len`.
    pub fn send(&mut self, len: usize, offset: usize) -> Result<usize> {
        const OP: &str = "send";
        self.qp.expect_state(OP, QpState::Rts)?;
        let sge = self.local_sge(OP, len, offset)?;

        let wr = SendWr {
            wr_id: self.next_wr_id(0),
            sge,
            op: SendOp::Send,
            signaled: true,
        };
        self.post_and_wait(OP, wr)?;
        Ok(len)
    }

    /// Wait for the oldest posted receive, which must be the one of `len`
    /// bytes at `offset`. Returns the number of bytes the peer sent.
    ///
    /// After a timeout the receive stays posted and a later `recv` may
    /// collect it.
    pub fn recv(&mut self, len: usize, offset: usize) -> Result<usize> {
        const OP: &str = "recv";
        let front = *self.pending.front().ok_or(Error::NoPendingReceive { op: OP })?;
        if front.offset != offset || front.len != len {
            return Err(Error::ReceiveMismatch {
                op: OP,
                posted_offset: front.offset,
                posted_len: front.len,
                offset,
                len,
            });
        }

        let result = self.complete(OP, front.wr_id);
        if !matches!(result, Err(Error::Timeout { .. })) {
            self.pending.pop_front();
        }
        let wc = result?;
        log::trace!("received {} bytes at offset {}", wc.byte_len, offset);
        Ok(wc.byte_len as usize)
    }

    /// Write `len` bytes at `offset` into the peer's buffer at
    /// `remote_offset`, without involving the peer's CPU.
    pub fn write(&mut self, len: usize, offset: usize, remote_offset: usize) -> Result<usize> {
        self.one_sided("write", true, len, offset, remote_offset)
    }

    /// Read `len` bytes from the peer's buffer at `remote_offset` into the
    /// buffer at `offset`.
    pub fn read(&mut self, len: usize, offset: usize, remote_offset: usize) -> Result<usize> {
        self.one_sided("read", false, len, offset, remote_offset)
    }

    fn one_sided(
        &mut self,
        op: &'static str,
        writing: bool,
        len: usize,
        offset: usize,
        remote_offset: usize,
    ) -> Result<usize> {
        self.qp.expect_state(op, QpState::Rts)?;
        let peer = self.peer.ok_or(Error::NoPeer { op })?;
        let remote = peer.remote().ok_or(Error::RemoteAccessDenied { op })?;
        let sge = self.local_sge(op, len, offset)?;
        let remote_addr = remote
            .addr
            .checked_add(remote_offset as u64)
            .ok_or(Error::OutOfBounds {
                op,
                offset: remote_offset,
                len,
                extent: (u64::MAX - remote.addr) as usize,
            })?;

        let send_op = if writing {
            SendOp::Write {
                remote_addr,
                rkey: remote.rkey,
            }
        } else {
            SendOp::Read {
                remote_addr,
                rkey: remote.rkey,
            }
        };
        let wr = SendWr {
            wr_id: self.next_wr_id(ONE_SIDED_TAG),
            sge,
            op: send_op,
            signaled: true,
        };
        self.post_and_wait(op, wr)?;
        Ok(len)
    }
}

impl AsRawFd for RdmaCommunicator {
    fn as_raw_fd(&self) -> RawFd {
        self.ctrl.as_raw_fd()
    }
}

impl fmt::Debug for RdmaCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaCommunicator")
            .field("device", &self.ctx.name())
            .field("qp", &self.qp)
            .field("peer", &self.peer)
            .field("buffer", &self.buffer)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Drop for RdmaCommunicator {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::debug!(
                "QP {:#x}: dropping {} uncollected receive(s)",
                self.qp.qp_num(),
                self.pending.len()
            );
        }
        log::debug!("tearing down QP {:#x} on {}", self.qp.qp_num(), self.ctx.name());
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::rdma::provider::soft::SoftFabric;
    use crate::rdma::wc::WcStatus;

    const HELLO: &[u8] = b"Hello RDMA SEND via pure libibverbs.";

    fn open(fabric: &SoftFabric, stream: UnixStream, device: &str) -> RdmaCommunicator {
        let mut comm = RdmaCommunicator::new(stream, fabric, device, 0).unwrap();
        comm.set_buffer(vec![0u8; 1024].into_boxed_slice()).unwrap();
        comm
    }

    /// Two connected communicators on `soft_0` and `soft_1`.
    fn pair(fabric: &SoftFabric, grant: bool) -> (RdmaCommunicator, RdmaCommunicator) {
        let (x, y) = UnixStream::pair().unwrap();
        let mut a = open(fabric, x, "soft_0");
        let mut b = open(fabric, y, "soft_1");
        thread::scope(|s| {
            let server = s.spawn(|| b.establish(Role::Server, grant).unwrap());
            a.establish(Role::Client, grant).unwrap();
            server.join().unwrap();
        });
        (a, b)
    }

    fn fabric() -> SoftFabric {
        SoftFabric::with_devices(&["soft_0", "soft_1"])
    }

    #[test]
    fn hello_send() -> anyhow::Result<()> {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);
        assert_eq!(a.qp_state(), QpState::Rts);
        assert_eq!(b.peer().map(|p| p.qpn), Some(a.qp_num()));

        let mut msg = [0u8; 41];
        msg[..HELLO.len()].copy_from_slice(HELLO);
        b.buffer_mut().unwrap()[..41].copy_from_slice(&msg);

        a.post_receive(41, 0)?;
        assert_eq!(b.send(41, 0)?, 41);
        assert_eq!(a.recv(41, 0)?, 41);
        assert_eq!(&a.buffer().unwrap()[..41], &msg);
        assert_eq!(a.pending_receives(), 0);
        Ok(())
    }

    #[test]
    fn short_message_reports_its_length() -> anyhow::Result<()> {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);

        b.buffer_mut().unwrap()[..37].fill(b'x');
        a.post_receive(1024, 0)?;
        b.send(37, 0)?;
        assert_eq!(a.recv(1024, 0)?, 37);
        assert_eq!(a.buffer().unwrap()[36], b'x');
        assert_eq!(a.buffer().unwrap()[37], 0);
        Ok(())
    }

    #[test]
    fn send_waits_for_a_late_receive() -> anyhow::Result<()> {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);
        b.buffer_mut().unwrap()[..4].copy_from_slice(b"late");

        thread::scope(|s| -> anyhow::Result<()> {
            let sender = s.spawn(|| b.send(4, 0));
            thread::sleep(Duration::from_millis(20));
            a.post_receive(16, 100)?;
            assert_eq!(a.recv(16, 100)?, 4);
            assert_eq!(sender.join().unwrap()?, 4);
            Ok(())
        })?;
        assert_eq!(&a.buffer().unwrap()[100..104], b"late");
        Ok(())
    }

    #[test]
    fn out_of_bounds_never_reaches_the_provider() {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);
        let posts = fabric.post_calls(b.qp_num());

        assert!(matches!(b.send(2000, 0), Err(Error::OutOfBounds { .. })));
        assert!(matches!(b.send(10, 1020), Err(Error::OutOfBounds { .. })));
        assert!(matches!(a.post_receive(1025, 0), Err(Error::OutOfBounds { .. })));
        assert_eq!(fabric.post_calls(b.qp_num()), posts);
        assert_eq!(a.pending_receives(), 0);
    }

    #[test]
    fn oversized_message_fails_both_sides() {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);

        a.post_receive(8, 0).unwrap();
        let err = b.send(16, 0).unwrap_err();
        assert_eq!(err.wc_status(), Some(WcStatus::RemInvReqErr));
        let err = a.recv(8, 0).unwrap_err();
        assert_eq!(err.wc_status(), Some(WcStatus::LocLenErr));

        assert_eq!(a.qp_state(), QpState::Error);
        assert_eq!(b.qp_state(), QpState::Error);
        assert!(matches!(b.send(1, 0), Err(Error::State { actual: QpState::Error, .. })));
    }

    #[test]
    fn recv_must_match_oldest_receive() -> anyhow::Result<()> {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);

        assert!(matches!(a.recv(8, 0), Err(Error::NoPendingReceive { .. })));
        a.post_receive(8, 0)?;
        a.post_receive(8, 8)?;
        assert!(matches!(
            a.recv(8, 8),
            Err(Error::ReceiveMismatch {
                posted_offset: 0,
                posted_len: 8,
                ..
            })
        ));
        assert!(matches!(
            a.set_buffer(vec![0u8; 16].into_boxed_slice()),
            Err(Error::BufferBusy { pending: 2, .. })
        ));

        b.buffer_mut().unwrap()[..6].copy_from_slice(b"first!");
        b.send(6, 0)?;
        b.buffer_mut().unwrap()[..3].copy_from_slice(b"two");
        b.send(3, 0)?;
        assert_eq!(a.recv(8, 0)?, 6);
        assert_eq!(a.recv(8, 8)?, 3);
        assert_eq!(&a.buffer().unwrap()[..11], b"first!\0\0two");
        Ok(())
    }

    #[test]
    fn recv_timeout_keeps_the_receive_posted() -> anyhow::Result<()> {
        let fabric = fabric();
        let (mut a, mut b) = pair(&fabric, false);
        a.set_poll_timeout(Some(Duration::from_millis(30)));

        a.post_receive(16, 0)?;
        match a.recv(16, 0) {
            Err(Error::Timeout { op, waited }) => {
                assert_eq!(op, "recv");
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(a.pending_receives(), 1);
        assert_eq!(a.qp_state(), QpState::Rts);

        b.send(16, 0)?;
        assert_eq!(a.recv(16, 0)?, 16);
        Ok(())
    }

    #[test]
    fn one_sided_access_needs_a_grant() -> anyhow::Result<()> {
        let fabric = fabric();
        let (mut a, _b) = pair(&fabric, false);
        let posts = fabric.post_calls(a.qp_num());
        assert!(matches!(a.write(4, 0, 0), Err(Error::RemoteAccessDenied { .. })));
        assert!(matches!(a.read(4, 0, 0), Err(Error::RemoteAccessDenied { .. })));
        assert_eq!(fabric.post_calls(a.qp_num()), posts);

        let (mut a, mut b) = pair(&fabric, true);
        a.buffer_mut().unwrap()[..4].copy_from_slice(b"abcd");
        assert_eq!(a.write(4, 0, 8)?, 4);
        assert_eq!(&b.buffer().unwrap()[8..12], b"abcd");

        b.buffer_mut().unwrap()[100..104].copy_from_slice(b"wxyz");
        assert_eq!(a.read(4, 16, 100)?, 4);
        assert_eq!(&a.buffer().unwrap()[16..20], b"wxyz");

        // Past the end of the peer's region.
        let err = a.write(8, 0, 1020).unwrap_err();
        assert_eq!(err.wc_status(), Some(WcStatus::RemAccessErr));
        Ok(())
    }

    #[test]
    fn operations_check_state_and_buffer() -> anyhow::Result<()> {
        let fabric = fabric();
        let (x, _y) = UnixStream::pair()?;
        let mut comm = RdmaCommunicator::new(x, &fabric, "soft_0", 0)?;

        assert!(matches!(comm.post_receive(8, 0), Err(Error::NoBuffer { .. })));
        comm.set_buffer(vec![0u8; 64].into_boxed_slice())?;
        assert!(matches!(
            comm.post_receive(8, 0),
            Err(Error::State { actual: QpState::Reset, .. })
        ));
        assert!(matches!(comm.send(8, 0), Err(Error::State { .. })));
        assert!(matches!(comm.write(8, 0, 0), Err(Error::State { .. })));

        comm.to_init()?;
        comm.post_receive(8, 0)?;
        assert_eq!(comm.pending_receives(), 1);
        Ok(())
    }

    #[test]
    fn device_selection() -> anyhow::Result<()> {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1", "mock_0"]);

        let (x, _y) = UnixStream::pair()?;
        let comm = RdmaCommunicator::new(x, &fabric, "mock_.*", 0)?;
        assert_eq!(comm.device_name(), "mock_0");
        assert_eq!(comm.port().gid, fabric.gid("mock_0", 0).unwrap());

        for bad in ["nonexistent", "soft_.*", "("] {
            let (x, _y) = UnixStream::pair()?;
            let err = RdmaCommunicator::new(x, &fabric, bad, 0).unwrap_err();
            assert!(matches!(err, Error::Device { .. }), "{}: {:?}", bad, err);
        }

        let (x, _y) = UnixStream::pair()?;
        let err = RdmaCommunicator::new(x, &fabric, "soft_1", 9).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));

        fabric.set_port_state("soft_1", PortState::Down);
        let (x, _y) = UnixStream::pair()?;
        let err = RdmaCommunicator::new(x, &fabric, "soft_1", 0).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
        Ok(())
    }

    #[test]
    fn buffer_registration() -> anyhow::Result<()> {
        let fabric = fabric();
        let (x, _y) = UnixStream::pair()?;
        let mut comm = RdmaCommunicator::new(x, &fabric, "soft_0", 0)?;

        let err = comm.set_buffer(Box::new([])).unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
        assert_eq!(fabric.registered_regions(), 0);

        assert!(comm.set_buffer(vec![1u8; 32].into_boxed_slice())?.is_none());
        let old = comm.set_buffer(vec![2u8; 16].into_boxed_slice())?.unwrap();
        assert_eq!(&old[..], &[1u8; 32][..]);
        assert_eq!(fabric.registered_regions(), 1);
        assert_eq!(comm.buffer().unwrap(), &[2u8; 16][..]);

        assert!(comm.local_descriptor(false).remote().is_none());
        let granted = comm.local_descriptor(true).remote().unwrap();
        assert_eq!(granted.addr, comm.buffer().unwrap().as_ptr() as u64);

        let qpn = comm.qp_num();
        drop(comm);
        assert_eq!(fabric.registered_regions(), 0);
        assert_eq!(fabric.qp_state(qpn), None);
        Ok(())
    }

    #[test]
    fn closed_control_stream_fails_establish() -> anyhow::Result<()> {
        let fabric = fabric();
        let (x, y) = UnixStream::pair()?;
        drop(y);
        let mut comm = open(&fabric, x, "soft_0");
        let err = comm.establish(Role::Server, false).unwrap_err();
        assert!(err.is_connection_closed(), "{:?}", err);
        assert_eq!(comm.qp_state(), QpState::Init);
        Ok(())
    }
}
