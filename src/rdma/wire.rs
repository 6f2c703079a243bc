//! The connection descriptor exchanged over the control channel.
//!
//! Encoding is exactly 32 bytes in network byte order:
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 4    | `qpn`   |
//! | 4      | 4    | `rkey`  |
//! | 8      | 8    | `vaddr` |
//! | 16     | 16   | `gid`   |

use std::fmt;

use super::gid::Gid;
use super::type_alias::*;
use crate::ctrl::{ControlChannel, Role};
use crate::error::Result;

/// Remote registered memory advertised by a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MrRemote {
    pub addr: u64,
    pub rkey: RKey,
}

/// What one peer tells the other to connect an RC queue pair.
///
/// `rkey == 0 && vaddr == 0` means the sender grants no one-sided access.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct WireMsg {
    pub qpn: Qpn,
    pub rkey: RKey,
    pub vaddr: u64,
    pub gid: Gid,
}

impl WireMsg {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    /// Create a descriptor that grants no one-sided access.
    pub fn new(qpn: Qpn, gid: Gid) -> Self {
        Self {
            qpn,
            rkey: 0,
            vaddr: 0,
            gid,
        }
    }

    /// Advertise a memory region for one-sided access.
    pub fn with_remote(self, remote: MrRemote) -> Self {
        Self {
            rkey: remote.rkey,
            vaddr: remote.addr,
            ..self
        }
    }

    /// Get the advertised memory region, if any.
    pub fn remote(&self) -> Option<MrRemote> {
        if self.rkey == 0 && self.vaddr == 0 {
            None
        } else {
            Some(MrRemote {
                addr: self.vaddr,
                rkey: self.rkey,
            })
        }
    }

    /// Serialize into the wire format.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.qpn.to_be_bytes());
        buf[4..8].copy_from_slice(&self.rkey.to_be_bytes());
        buf[8..16].copy_from_slice(&self.vaddr.to_be_bytes());
        buf[16..32].copy_from_slice(self.gid.as_bytes());
        buf
    }

    /// Deserialize from the wire format.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut qpn = [0u8; 4];
        let mut rkey = [0u8; 4];
        let mut vaddr = [0u8; 8];
        let mut gid = [0u8; 16];
        qpn.copy_from_slice(&buf[0..4]);
        rkey.copy_from_slice(&buf[4..8]);
        vaddr.copy_from_slice(&buf[8..16]);
        gid.copy_from_slice(&buf[16..32]);

        Self {
            qpn: u32::from_be_bytes(qpn),
            rkey: u32::from_be_bytes(rkey),
            vaddr: u64::from_be_bytes(vaddr),
            gid: Gid::from(gid),
        }
    }

    /// Write this descriptor to the channel.
    pub fn send(&self, ch: &mut ControlChannel) -> Result<()> {
        ch.write_all("exchange_descriptor", &self.encode())
    }

    /// Read one whole descriptor from the channel.
    pub fn recv(ch: &mut ControlChannel) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        ch.read_exact("exchange_descriptor", &mut buf)?;
        Ok(Self::decode(&buf))
    }
}

impl fmt::Debug for WireMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMsg")
            .field("qpn", &format_args!("{:#x}", self.qpn))
            .field("rkey", &format_args!("{:#x}", self.rkey))
            .field("vaddr", &format_args!("{:#x}", self.vaddr))
            .field("gid", &self.gid)
            .finish()
    }
}

/// Write `local`, then read the peer's descriptor.
///
/// Both peers may call this at the same time: 32 bytes always fit in the
/// stream's send buffer, so neither write blocks on the other side's read.
pub fn exchange(ch: &mut ControlChannel, local: &WireMsg) -> Result<WireMsg> {
    local.send(ch)?;
    let peer = WireMsg::recv(ch)?;
    log::debug!("exchanged descriptors: local {:?}, peer {:?}", local, peer);
    Ok(peer)
}

/// Exchange descriptors in a fixed order: the client writes first and the
/// server reads first. The two sides must pass opposite roles.
pub fn exchange_ordered(ch: &mut ControlChannel, local: &WireMsg, role: Role) -> Result<WireMsg> {
    let peer = match role {
        Role::Client => {
            local.send(ch)?;
            WireMsg::recv(ch)?
        }
        Role::Server => {
            let peer = WireMsg::recv(ch)?;
            local.send(ch)?;
            peer
        }
    };
    log::debug!("exchanged descriptors as {:?}: local {:?}, peer {:?}", role, local, peer);
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::Ipv6Addr;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::error::Error;

    fn sample() -> WireMsg {
        WireMsg {
            qpn: 0x0001_0203,
            rkey: 0x0a0b_0c0d,
            vaddr: 0x1122_3344_5566_7788,
            gid: Gid::from("fe80::1".parse::<Ipv6Addr>().unwrap()),
        }
    }

    #[test]
    fn layout_is_big_endian() {
        let buf = sample().encode();
        assert_eq!(&buf[0..4], &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(&buf[4..8], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&buf[8..16], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(buf[16], 0xfe);
        assert_eq!(buf[17], 0x80);
        assert_eq!(buf[31], 0x01);
        assert_eq!(WireMsg::decode(&buf), sample());
    }

    #[test]
    fn zero_capability_survives_round_trip() {
        let msg = WireMsg::new(0x42, sample().gid);
        let back = WireMsg::decode(&msg.encode());
        assert_eq!(back, msg);
        assert_eq!(back.remote(), None);

        let granted = msg.with_remote(MrRemote { addr: 0x1000, rkey: 7 });
        assert_eq!(
            WireMsg::decode(&granted.encode()).remote(),
            Some(MrRemote { addr: 0x1000, rkey: 7 })
        );
    }

    #[test]
    fn edge_values_survive_round_trip() {
        let gid = sample().gid;
        let cases = [
            (WireMsg { qpn: u32::MAX, rkey: u32::MAX, vaddr: u64::MAX, gid: Gid::from([0xff; 16]) }, true),
            (WireMsg { qpn: 0, rkey: 0, vaddr: 0, gid: Gid::ZERO }, false),
            (WireMsg { qpn: 1, rkey: 0, vaddr: 0xdead_beef_0000, gid }, true),
            (WireMsg { qpn: 1, rkey: 0x55, vaddr: 0, gid }, true),
            (WireMsg { qpn: 0x00ff_ffff, rkey: 1, vaddr: 1 << 63, gid }, true),
        ];
        for (msg, granted) in cases {
            let back = WireMsg::decode(&msg.encode());
            assert_eq!(back, msg);
            assert_eq!(back.remote().is_some(), granted, "{:?}", msg);
        }
    }

    #[test]
    fn simultaneous_exchange() -> anyhow::Result<()> {
        let (a, b) = UnixStream::pair()?;
        let peer = thread::spawn(move || {
            let mut ch = ControlChannel::from(b);
            exchange(&mut ch, &WireMsg::new(2, sample().gid))
        });

        let mut ch = ControlChannel::from(a);
        let got = exchange(&mut ch, &sample())?;
        assert_eq!(got.qpn, 2);
        assert_eq!(peer.join().unwrap()?, sample());
        Ok(())
    }

    #[test]
    fn ordered_exchange() -> anyhow::Result<()> {
        let (a, b) = UnixStream::pair()?;
        let peer = thread::spawn(move || {
            let mut ch = ControlChannel::from(b);
            exchange_ordered(&mut ch, &WireMsg::new(2, Gid::ZERO), Role::Server)
        });

        let mut ch = ControlChannel::from(a);
        let got = exchange_ordered(&mut ch, &sample(), Role::Client)?;
        assert_eq!(got, WireMsg::new(2, Gid::ZERO));
        assert_eq!(peer.join().unwrap()?, sample());
        Ok(())
    }

    #[test]
    fn partial_descriptor_is_connection_closed() -> anyhow::Result<()> {
        let (a, mut b) = UnixStream::pair()?;
        b.write_all(&sample().encode()[..10])?;
        drop(b);

        let mut ch = ControlChannel::from(a);
        match exchange(&mut ch, &sample()) {
            Err(Error::ConnectionClosed { op }) => assert_eq!(op, "exchange_descriptor"),
            // The write may already observe the closed peer.
            Err(Error::Io { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        Ok(())
    }
}
