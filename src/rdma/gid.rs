use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// An 128-bit identifier of a port on a network adapter.
///
/// On RoCE ports this is an IPv6 address (or an IPv4-mapped one for RoCE v2),
/// so the type converts freely to and from [`Ipv6Addr`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Gid([u8; 16]);

impl Gid {
    /// The all-zero GID, which never identifies a reachable port.
    pub const ZERO: Self = Self([0; 16]);

    /// Get the raw bytes in network order.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether every byte is zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Get the subnet prefix (high 64 bits).
    #[inline]
    pub fn subnet_prefix(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap_or_default())
    }

    /// Get the interface identifier (low 64 bits).
    #[inline]
    pub fn interface_id(&self) -> u64 {
        u64::from_be_bytes(self.0[8..].try_into().unwrap_or_default())
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gid = Ipv6Addr::from(*self);
        f.debug_tuple("Gid").field(&gid.to_string()).finish()
    }
}

impl fmt::Display for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from(*self).fmt(f)
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Ipv4Addr> for Gid {
    /// Build the IPv4-mapped GID a RoCE v2 port uses for this address.
    #[inline]
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr.to_ipv6_mapped().octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<Gid> for [u8; 16] {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}
