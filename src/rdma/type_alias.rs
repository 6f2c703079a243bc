/// [`u8`]: **Port number**, identifies a port on an HCA. Numbering starts at 1.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, identifies a port in an InfiniBand subnet.
pub type Lid = u16;

/// [`u8`]: **Global identifier (GID) index**, selects an entry in a port's GID table.
pub type GidIndex = u8;

/// [`u32`]: **Queue pair number**, identifies a queue pair on its device.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, identifies a packet in a flow.
pub type Psn = u32;

/// [`u32`]: **Local key**, authorizes local access to a memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, authorizes remote access to a memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, echoed back in the work completion.
pub type WrId = u64;
