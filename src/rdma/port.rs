use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use super::gid::Gid;
use super::type_alias::*;

/// Port state. Values match `enum ibv_port_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Logical link is down. The physical link of the port isn't up.
    Down = 1,

    /// Logical link is Initializing.
    /// The physical link is up, but the SM hasn't configured the logical link yet.
    Init = 2,

    /// Logical link is Armed.
    /// The physical link is up, but the SM hasn't fully configured the logical link yet.
    Armed = 3,

    /// Logical link is Active.
    /// TX/RX all packets.
    Active = 4,

    /// Logical link is Active Deferred.
    /// The physical link is suffering from a failure and may recover.
    ActiveDefer = 5,
}

impl PortState {
    /// Cast a raw `ibv_port_state`. Unknown values are treated as `Down`.
    pub fn from_raw(state: u32) -> Self {
        match state {
            2 => PortState::Init,
            3 => PortState::Armed,
            4 => PortState::Active,
            5 => PortState::ActiveDefer,
            _ => PortState::Down,
        }
    }
}

/// Port link layer protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLinkLayer {
    /// Infiniband.
    Infiniband,

    /// Ethernet (RoCE).
    Ethernet,
}

/// Port MTU size. Values match `enum ibv_mtu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PortMtu {
    /// 256 bytes.
    Mtu256 = 1,

    /// 512 bytes.
    Mtu512 = 2,

    /// 1024 bytes.
    Mtu1024 = 3,

    /// 2048 bytes.
    Mtu2048 = 4,

    /// 4096 bytes.
    Mtu4096 = 5,
}

impl PortMtu {
    /// Get the MTU in bytes.
    #[inline]
    pub fn bytes(&self) -> u32 {
        256 << (*self as u32 - 1)
    }

    /// Cast a raw `ibv_mtu`.
    pub fn from_raw(mtu: u32) -> Option<Self> {
        Some(match mtu {
            1 => PortMtu::Mtu256,
            2 => PortMtu::Mtu512,
            3 => PortMtu::Mtu1024,
            4 => PortMtu::Mtu2048,
            5 => PortMtu::Mtu4096,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for PortMtu {
    type Error = String;

    /// Parse an MTU given in bytes.
    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        Ok(match bytes {
            256 => PortMtu::Mtu256,
            512 => PortMtu::Mtu512,
            1024 => PortMtu::Mtu1024,
            2048 => PortMtu::Mtu2048,
            4096 => PortMtu::Mtu4096,
            _ => return Err(format!("{} is not a valid path MTU", bytes)),
        })
    }
}

impl From<PortMtu> for u32 {
    fn from(mtu: PortMtu) -> Self {
        mtu.bytes()
    }
}

impl Display for PortMtu {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}

/// Attributes of the physical port a device context is bound to.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port number on the device.
    pub num: PortNum,

    /// Logical link state.
    pub state: PortState,

    /// LID; meaningful on InfiniBand only.
    pub lid: Lid,

    /// Link layer protocol.
    pub link_layer: PortLinkLayer,

    /// Currently active MTU.
    pub active_mtu: PortMtu,

    /// Largest message a single work request may carry.
    pub max_msg_sz: u32,

    /// GID selected for this context.
    pub gid: Gid,

    /// Index of `gid` in the port's GID table.
    pub gid_index: GidIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_bytes() {
        assert_eq!(PortMtu::Mtu256.bytes(), 256);
        assert_eq!(PortMtu::Mtu1024.bytes(), 1024);
        assert_eq!(PortMtu::Mtu4096.bytes(), 4096);
        assert_eq!(PortMtu::try_from(2048), Ok(PortMtu::Mtu2048));
        assert!(PortMtu::try_from(1500).is_err());
        assert_eq!(PortMtu::from_raw(3), Some(PortMtu::Mtu1024));
        assert_eq!(PortMtu::Mtu512.to_string(), "512B");
    }
}
