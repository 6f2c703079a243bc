use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Memory region and queue pair access permissions.
///
/// Bit values match `enum ibv_access_flags`, so providers can pass them through.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    /// Get the raw bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Combine two permission sets in constant context.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Permission {
    /// Allow local write and remote read/write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Permission, &str); 4] = [
            (Permission::LOCAL_WRITE, "LOCAL_WRITE"),
            (Permission::REMOTE_WRITE, "REMOTE_WRITE"),
            (Permission::REMOTE_READ, "REMOTE_READ"),
            (Permission::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
        ];
        let set = NAMES
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>();
        write!(f, "Permission({})", set.join(" | "))
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
