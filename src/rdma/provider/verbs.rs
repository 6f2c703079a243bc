//! Provider backed by `libibverbs`.

use std::ffi::{c_int, c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{io, mem};

use super::*;
use crate::bindings::*;
use crate::rdma::port::{PortLinkLayer, PortState};
use crate::rdma::wc::{WcOpcode, WcStatus};
use crate::utils::interop::*;

/// How many completions are polled into the stack buffer at once.
const POLL_BATCH: usize = 16;

/// Opens RDMA devices through `libibverbs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbsProvider;

/// The device list returned by `ibv_get_device_list`.
struct DeviceList {
    list: NonNull<*mut ibv_device>,
    len: usize,
}

impl DeviceList {
    fn new() -> io::Result<Self> {
        let mut len = 0;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut len) };
        let list = from_c_ptr(list)?;
        Ok(Self {
            list,
            len: len.max(0) as usize,
        })
    }

    fn iter(&self) -> impl Iterator<Item = *mut ibv_device> + '_ {
        // SAFETY: the list holds `len` valid entries until it is freed.
        (0..self.len).map(move |i| unsafe { *self.list.as_ptr().add(i) })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // SAFETY: FFI; the list came from `ibv_get_device_list`.
        unsafe { ibv_free_device_list(self.list.as_ptr()) };
    }
}

fn device_name(dev: *mut ibv_device) -> String {
    // SAFETY: `ibv_get_device_name` returns a NUL-terminated string owned by
    // the device, which outlives this call.
    unsafe { CStr::from_ptr(ibv_get_device_name(dev)) }
        .to_string_lossy()
        .into_owned()
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

struct IbvContext(NonNull<ibv_context>);
impl_ibv_wrapper_traits!(ibv_context, IbvContext);

impl Drop for IbvContext {
    fn drop(&mut self) {
        // SAFETY: FFI; every object created on this context is gone by now.
        let ret = unsafe { ibv_close_device(self.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("ibv_close_device failed: {}", e);
        }
    }
}

struct IbvPd(NonNull<ibv_pd>);
impl_ibv_wrapper_traits!(ibv_pd, IbvPd);

impl Drop for IbvPd {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("ibv_dealloc_pd failed: {}", e);
        }
    }
}

/// An opened device and its protection domain, dropped in that reverse order.
struct ContextInner {
    pd: IbvPd,
    ctx: IbvContext,
}

/// A device opened by [`VerbsProvider`].
struct VerbsContext {
    inner: Arc<ContextInner>,
    name: String,
    port: PortInfo,
}

impl Provider for VerbsProvider {
    fn device_names(&self) -> io::Result<Vec<String>> {
        let list = DeviceList::new()?;
        Ok(list.iter().map(device_name).collect())
    }

    fn open(
        &self,
        device: &str,
        port_num: PortNum,
        gid_index: GidIndex,
    ) -> io::Result<Box<dyn DeviceContext>> {
        let ctx = {
            let list = DeviceList::new()?;
            let dev = list
                .iter()
                .find(|&dev| device_name(dev) == device)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no device named {}", device))
                })?;

            // SAFETY: FFI; the device is opened before the list is freed.
            IbvContext(from_c_ptr(unsafe { ibv_open_device(dev) })?)
        };

        // SAFETY: POD type.
        let mut dev_attr: ibv_device_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_query_device(ctx.as_ptr(), &mut dev_attr) })?;
        if port_num == 0 || port_num > dev_attr.phys_port_cnt {
            return Err(invalid_input(format!(
                "{} has ports 1..={}, not {}",
                device, dev_attr.phys_port_cnt, port_num
            )));
        }

        // SAFETY: POD type.
        let mut port_attr: ibv_port_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ___ibv_query_port(ctx.as_ptr(), port_num, &mut port_attr) })?;
        if gid_index as c_int >= port_attr.gid_tbl_len {
            return Err(invalid_input(format!(
                "GID index {} out of range on {} port {} ({} entries)",
                gid_index, device, port_num, port_attr.gid_tbl_len
            )));
        }

        // SAFETY: POD type.
        let mut gid: ibv_gid = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_query_gid(ctx.as_ptr(), port_num, gid_index as c_int, &mut gid) })?;

        let active_mtu = PortMtu::from_raw(port_attr.active_mtu).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown active MTU {}", port_attr.active_mtu),
            )
        })?;
        let port = PortInfo {
            num: port_num,
            state: PortState::from_raw(port_attr.state),
            lid: port_attr.lid,
            link_layer: match port_attr.link_layer {
                IBV_LINK_LAYER_ETHERNET => PortLinkLayer::Ethernet,
                _ => PortLinkLayer::Infiniband,
            },
            active_mtu,
            max_msg_sz: port_attr.max_msg_sz,
            // SAFETY: every bit pattern is a valid `[u8; 16]`.
            gid: Gid::from(unsafe { gid.raw }),
            gid_index,
        };

        // SAFETY: FFI.
        let pd = IbvPd(from_c_ptr(unsafe { ibv_alloc_pd(ctx.as_ptr()) })?);
        log::debug!("opened {} port {}: {:?}", device, port_num, port);

        Ok(Box::new(VerbsContext {
            inner: Arc::new(ContextInner { pd, ctx }),
            name: device.to_owned(),
            port,
        }))
    }
}

impl DeviceContext for VerbsContext {
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
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                self.inner.ctx.as_ptr(),
                caps.cq_depth as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        let cq = Arc::new(IbvCq(from_c_ptr(cq)?, self.inner.clone()));

        // SAFETY: POD type.
        let mut init_attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        init_attr.send_cq = cq.as_ptr();
        init_attr.recv_cq = cq.as_ptr();
        init_attr.cap = ibv_qp_cap {
            max_send_wr: caps.max_send_wr,
            max_recv_wr: caps.max_recv_wr,
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
            max_inline_data: 0,
        };
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 0;

        // SAFETY: FFI.
        let qp = unsafe { ibv_create_qp(self.inner.pd.as_ptr(), &mut init_attr) };
        let qp = IbvQp(from_c_ptr(qp)?, cq.clone());

        Ok((
            Box::new(VerbsCq {
                cq,
                capacity: caps.cq_depth,
            }),
            Box::new(qp),
        ))
    }

    unsafe fn reg_mr(
        &self,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Box<dyn MemoryRegion>> {
        let mr = ibv_reg_mr(
            self.inner.pd.as_ptr(),
            addr as *mut c_void,
            len,
            perm.bits() as c_int,
        );
        Ok(Box::new(IbvMr(from_c_ptr(mr)?, self.inner.clone())))
    }
}

/// A completion queue, kept alive by the queue pair that uses it.
struct IbvCq(NonNull<ibv_cq>, Arc<ContextInner>);
impl_ibv_wrapper_traits!(ibv_cq, IbvCq);

impl Drop for IbvCq {
    fn drop(&mut self) {
        // SAFETY: FFI; no queue pair refers to this CQ any more.
        let ret = unsafe { ibv_destroy_cq(self.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("ibv_destroy_cq failed: {}", e);
        }
    }
}

struct VerbsCq {
    cq: Arc<IbvCq>,
    capacity: u32,
}

impl CompletionQueue for VerbsCq {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn poll(&self, wc: &mut [Wc]) -> io::Result<usize> {
        // SAFETY: POD type.
        let mut raw: [ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
        let num = wc.len().min(POLL_BATCH);

        // SAFETY: FFI; `raw` has room for `num` entries.
        let n = unsafe { ibv_poll_cq(self.cq.as_ptr(), num as c_int, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ibv_poll_cq returned {}", n),
            ));
        }

        let n = n as usize;
        for (dst, src) in wc.iter_mut().zip(&raw[..n]) {
            *dst = Wc {
                wr_id: src.wr_id,
                status: WcStatus::from(src.status),
                opcode: WcOpcode::from_raw(src.opcode),
                byte_len: src.byte_len,
                vendor_err: src.vendor_err,
                qp_num: src.qp_num,
            };
        }
        Ok(n)
    }
}

/// An RC queue pair, holding on to its completion queue.
struct IbvQp(NonNull<ibv_qp>, Arc<IbvCq>);
impl_ibv_wrapper_traits!(ibv_qp, IbvQp);

impl Drop for IbvQp {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_destroy_qp(self.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("ibv_destroy_qp failed: {}", e);
        }
    }
}

impl QueuePair for IbvQp {
    fn qp_num(&self) -> Qpn {
        // SAFETY: the queue pair is alive.
        unsafe { (*self.as_ptr()).qp_num }
    }

    fn modify(&self, transition: &QpTransition) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        let mask = match *transition {
            QpTransition::Init { port_num, access } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.pkey_index = 0;
                attr.port_num = port_num;
                attr.qp_access_flags = access.bits();
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QpTransition::Rtr(rtr) => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = rtr.path_mtu as u32;
                attr.dest_qp_num = rtr.dest_qpn;
                attr.rq_psn = rtr.rq_psn;
                attr.max_dest_rd_atomic = rtr.max_dest_rd_atomic;
                attr.min_rnr_timer = rtr.min_rnr_timer;

                attr.ah_attr.is_global = 1;
                attr.ah_attr.port_num = rtr.port_num;
                attr.ah_attr.grh.dgid = ibv_gid {
                    raw: *rtr.dgid.as_bytes(),
                };
                attr.ah_attr.grh.sgid_index = rtr.sgid_index;
                attr.ah_attr.grh.hop_limit = rtr.hop_limit;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QpTransition::Rts(rts) => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.sq_psn = rts.sq_psn;
                attr.timeout = rts.timeout;
                attr.retry_cnt = rts.retry_cnt;
                attr.rnr_retry = rts.rnr_retry;
                attr.max_rd_atomic = rts.max_rd_atomic;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };

        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, mask.0 as c_int) })
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };

        // SAFETY: POD type.
        let mut raw: ibv_send_wr = unsafe { mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;
        raw.send_flags = if wr.signaled {
            ibv_send_flags::IBV_SEND_SIGNALED.0
        } else {
            0
        };
        raw.opcode = match wr.op {
            SendOp::Send => ibv_wr_opcode::IBV_WR_SEND,
            SendOp::Write { .. } => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            SendOp::Read { .. } => ibv_wr_opcode::IBV_WR_RDMA_READ,
        };
        if let SendOp::Write { remote_addr, rkey } | SendOp::Read { remote_addr, rkey } = wr.op {
            raw.wr.rdma = rdma_t { remote_addr, rkey };
        }

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `sge` outlives the call.
        from_c_ret(unsafe { ibv_post_send(self.as_ptr(), &mut raw, &mut bad_wr) })
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut raw = ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `sge` outlives the call.
        from_c_ret(unsafe { ibv_post_recv(self.as_ptr(), &mut raw, &mut bad_wr) })
    }
}

/// A registered memory region.
struct IbvMr(NonNull<ibv_mr>, Arc<ContextInner>);
impl_ibv_wrapper_traits!(ibv_mr, IbvMr);

impl Drop for IbvMr {
    fn drop(&mut self) {
        // SAFETY: FFI.
        let ret = unsafe { ibv_dereg_mr(self.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            log::warn!("ibv_dereg_mr failed: {}", e);
        }
    }
}

impl MemoryRegion for IbvMr {
    fn addr(&self) -> *mut u8 {
        // SAFETY: the region is alive.
        unsafe { (*self.as_ptr()).addr as *mut u8 }
    }

    fn len(&self) -> usize {
        // SAFETY: the region is alive.
        unsafe { (*self.as_ptr()).length }
    }

    fn lkey(&self) -> LKey {
        // SAFETY: the region is alive.
        unsafe { (*self.as_ptr()).lkey }
    }

    fn rkey(&self) -> RKey {
        // SAFETY: the region is alive.
        unsafe { (*self.as_ptr()).rkey }
    }
}
