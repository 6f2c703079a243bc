use std::fmt;

use super::perm::Permission;
use super::port::{PortInfo, PortLinkLayer, PortMtu};
use super::provider::{QpTransition, QueuePair, RtrAttr, RtsAttr};
use super::type_alias::*;
use super::wire::WireMsg;
use crate::config::CommConfig;
use crate::error::{Error, Result};

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Freshly created; no work requests accepted.
    Reset,

    /// Initialized; receives may be posted.
    Init,

    /// Ready to receive.
    Rtr,

    /// Ready to send.
    Rts,

    /// A work request failed; the queue pair must be rebuilt.
    Error,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Error => "ERR",
        })
    }
}

/// Connection parameters applied during the state transitions.
#[derive(Debug, Clone, Copy)]
pub struct QpParams {
    /// Path MTU, capped by the port's active MTU. `None` uses the active MTU.
    pub path_mtu: Option<PortMtu>,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
    pub hop_limit: u8,
}

impl From<&CommConfig> for QpParams {
    fn from(config: &CommConfig) -> Self {
        Self {
            path_mtu: config.path_mtu,
            min_rnr_timer: config.min_rnr_timer,
            timeout: config.timeout,
            retry_cnt: config.retry_cnt,
            rnr_retry: config.rnr_retry,
            max_rd_atomic: config.max_rd_atomic,
            hop_limit: config.hop_limit,
        }
    }
}

/// An RC queue pair with its tracked state.
///
/// Each transition checks the tracked state first and then issues exactly
/// one provider modify call. A failed call leaves the tracked state as it was.
pub struct Qp {
    inner: Box<dyn QueuePair>,
    state: QpState,
    port: PortInfo,
    params: QpParams,
}

impl Qp {
    /// Initial packet sequence number of both directions.
    ///
    /// The wire descriptor carries no PSN, so both peers use this constant.
    pub const INIT_PSN: Psn = 0;

    /// Access flags granted to the peer at INIT.
    pub const ACCESS: Permission = Permission::LOCAL_WRITE
        .union(Permission::REMOTE_READ)
        .union(Permission::REMOTE_WRITE);

    pub(crate) fn new(inner: Box<dyn QueuePair>, port: PortInfo, params: QpParams) -> Self {
        Self {
            inner,
            state: QpState::Reset,
            port,
            params,
        }
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.inner.qp_num()
    }

    /// Get the tracked state.
    #[inline]
    pub fn state(&self) -> QpState {
        self.state
    }

    /// Get the port this queue pair is bound to.
    #[inline]
    pub fn port(&self) -> &PortInfo {
        &self.port
    }

    /// Get the path MTU used at RTR.
    pub fn path_mtu(&self) -> PortMtu {
        match self.params.path_mtu {
            Some(mtu) => mtu.min(self.port.active_mtu),
            None => self.port.active_mtu,
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> &dyn QueuePair {
        self.inner.as_ref()
    }

    /// Record that a work request on this queue pair failed.
    pub(crate) fn mark_failed(&mut self) {
        if self.state != QpState::Error {
            log::debug!("QP {:#x}: {} -> {}", self.qp_num(), self.state, QpState::Error);
            self.state = QpState::Error;
        }
    }

    pub(crate) fn expect_state(&self, op: &'static str, expected: QpState) -> Result<()> {
        if self.state != expected {
            return Err(Error::State {
                op,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn modify(&mut self, transition: QpTransition) -> std::io::Result<()> {
        let from = self.state;
        self.inner.modify(&transition)?;
        self.state = transition.target();
        log::debug!("QP {:#x}: {} -> {}", self.qp_num(), from, self.state);
        Ok(())
    }

    /// Modify the queue pair from RESET to INIT.
    pub fn to_init(&mut self) -> Result<()> {
        const OP: &str = "to_init";
        self.expect_state(OP, QpState::Reset)?;

        let transition = QpTransition::Init {
            port_num: self.port.num,
            access: Self::ACCESS,
        };
        self.modify(transition).map_err(|e| Error::device(OP, e))
    }

    /// Modify the queue pair from INIT to RTR, targeting `peer`.
    pub fn to_rtr(&mut self, peer: &WireMsg) -> Result<()> {
        const OP: &str = "to_rtr";
        self.expect_state(OP, QpState::Init)?;

        if peer.gid.is_zero() {
            return Err(Error::Address {
                op: OP,
                reason: format!("peer QP {:#x} advertised an all-zero GID", peer.qpn),
            });
        }
        if self.port.link_layer == PortLinkLayer::Infiniband {
            return Err(Error::Address {
                op: OP,
                reason: format!(
                    "port {} is InfiniBand and needs LID routing, which the descriptor does not carry",
                    self.port.num
                ),
            });
        }

        let transition = QpTransition::Rtr(RtrAttr {
            port_num: self.port.num,
            path_mtu: self.path_mtu(),
            dest_qpn: peer.qpn,
            rq_psn: Self::INIT_PSN,
            dgid: peer.gid,
            sgid_index: self.port.gid_index,
            hop_limit: self.params.hop_limit,
            max_dest_rd_atomic: self.params.max_rd_atomic,
            min_rnr_timer: self.params.min_rnr_timer,
        });
        self.modify(transition).map_err(|e| Error::Address {
            op: OP,
            reason: format!("path to {} (QP {:#x}) rejected: {}", peer.gid, peer.qpn, e),
        })
    }

    /// Modify the queue pair from RTR to RTS.
    ///
    /// `local` is the descriptor this side sent to the peer.
    pub fn to_rts(&mut self, local: &WireMsg) -> Result<()> {
        const OP: &str = "to_rts";
        self.expect_state(OP, QpState::Rtr)?;

        if local.qpn != self.qp_num() {
            return Err(Error::Address {
                op: OP,
                reason: format!(
                    "local descriptor names QP {:#x}, but this is QP {:#x}",
                    local.qpn,
                    self.qp_num()
                ),
            });
        }

        let transition = QpTransition::Rts(RtsAttr {
            sq_psn: Self::INIT_PSN,
            timeout: self.params.timeout,
            retry_cnt: self.params.retry_cnt,
            rnr_retry: self.params.rnr_retry,
            max_rd_atomic: self.params.max_rd_atomic,
        });
        self.modify(transition).map_err(|e| Error::device(OP, e))
    }
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qp")
            .field("qpn", &format_args!("{:#x}", self.qp_num()))
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::gid::Gid;
    use crate::rdma::provider::soft::SoftFabric;
    use crate::rdma::provider::{DeviceContext, Provider, QpCaps};

    const CAPS: QpCaps = QpCaps {
        cq_depth: 16,
        max_send_wr: 8,
        max_recv_wr: 8,
        max_send_sge: 1,
        max_recv_sge: 1,
    };

    fn make_qp(fabric: &SoftFabric, dev: &str) -> (Box<dyn DeviceContext>, Qp) {
        let ctx = fabric.open(dev, 1, 0).unwrap();
        let (_cq, qp) = ctx.create_qp(&CAPS).unwrap();
        let qp = Qp::new(qp, ctx.port().clone(), QpParams::from(&CommConfig::default()));
        (ctx, qp)
    }

    fn descriptor(qp: &Qp) -> WireMsg {
        WireMsg::new(qp.qp_num(), qp.port().gid)
    }

    #[test]
    fn transitions_reject_wrong_order() {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (_ctx, mut qp) = make_qp(&fabric, "soft_0");
        let (_peer_ctx, peer) = make_qp(&fabric, "soft_1");

        let err = qp.to_rtr(&descriptor(&peer)).unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                expected: QpState::Init,
                actual: QpState::Reset,
                ..
            }
        ));
        let err = qp.to_rts(&descriptor(&qp)).unwrap_err();
        assert!(matches!(err, Error::State { actual: QpState::Reset, .. }));

        // Rejected transitions never reach the provider.
        assert_eq!(fabric.modify_calls(qp.qp_num()), Some(0));

        qp.to_init().unwrap();
        assert!(matches!(qp.to_init(), Err(Error::State { actual: QpState::Init, .. })));
        assert!(matches!(qp.to_rts(&descriptor(&qp)), Err(Error::State { .. })));
        assert_eq!(qp.state(), QpState::Init);
        assert_eq!(fabric.modify_calls(qp.qp_num()), Some(1));
    }

    #[test]
    fn one_modify_call_per_transition() {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (_ctx, mut qp) = make_qp(&fabric, "soft_0");
        let (_peer_ctx, peer) = make_qp(&fabric, "soft_1");

        qp.to_init().unwrap();
        qp.to_rtr(&descriptor(&peer)).unwrap();
        qp.to_rts(&descriptor(&qp)).unwrap();

        assert_eq!(qp.state(), QpState::Rts);
        assert_eq!(fabric.qp_state(qp.qp_num()), Some(QpState::Rts));
        assert_eq!(fabric.modify_calls(qp.qp_num()), Some(3));
        assert_eq!(qp.path_mtu(), PortMtu::Mtu1024);
    }

    #[test]
    fn path_mtu_is_capped_by_the_port() {
        let fabric = SoftFabric::with_devices(&["soft_0"]);
        let ctx = fabric.open("soft_0", 1, 0).unwrap();

        let qp_with = |active_mtu, path_mtu| {
            let (_cq, raw) = ctx.create_qp(&CAPS).unwrap();
            let port = PortInfo {
                active_mtu,
                ..ctx.port().clone()
            };
            let params = QpParams {
                path_mtu,
                ..QpParams::from(&CommConfig::default())
            };
            Qp::new(raw, port, params).path_mtu()
        };

        let default_mtu = CommConfig::default().path_mtu;
        assert_eq!(qp_with(PortMtu::Mtu4096, default_mtu), PortMtu::Mtu1024);
        assert_eq!(qp_with(PortMtu::Mtu512, default_mtu), PortMtu::Mtu512);
        assert_eq!(qp_with(PortMtu::Mtu4096, Some(PortMtu::Mtu2048)), PortMtu::Mtu2048);
        assert_eq!(qp_with(PortMtu::Mtu4096, None), PortMtu::Mtu4096);
    }

    #[test]
    fn unresolvable_peers_are_address_errors() {
        let fabric = SoftFabric::with_devices(&["soft_0", "soft_1"]);
        let (_ctx, mut qp) = make_qp(&fabric, "soft_0");
        let (_peer_ctx, peer) = make_qp(&fabric, "soft_1");
        qp.to_init().unwrap();

        let zero = WireMsg::new(peer.qp_num(), Gid::ZERO);
        assert!(matches!(qp.to_rtr(&zero), Err(Error::Address { .. })));
        assert_eq!(fabric.modify_calls(qp.qp_num()), Some(1));

        let stranger = WireMsg::new(peer.qp_num(), "fd00::dead".parse::<std::net::Ipv6Addr>().unwrap().into());
        assert!(matches!(qp.to_rtr(&stranger), Err(Error::Address { .. })));
        assert_eq!(qp.state(), QpState::Init);

        qp.to_rtr(&descriptor(&peer)).unwrap();
        let wrong_local = descriptor(&peer);
        assert!(matches!(qp.to_rts(&wrong_local), Err(Error::Address { .. })));
        assert_eq!(qp.state(), QpState::Rtr);
    }
}
