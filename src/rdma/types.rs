//! Type aliases for RDMA wire-level identifiers.

/// Port number is a [`u8`] that identifies a physical port on the local HCA.
pub type PortNum = u8;

/// Local identifier (LID) is a [`u16`] that identifies a port within the subnet.
pub type Lid = u16;

/// GID index is a [`u8`] that selects a global identifier on a physical port.
pub type GidIndex = u8;

/// QP number (QPN) is a [`u32`] that identifies a queue pair on a node.
pub type Qpn = u32;

/// SRQ number is a [`u32`] that addresses a shared receive queue on a node.
pub type SrqNum = u32;

/// Packet sequence number (PSN) is a [`u32`] that identifies a packet in a flow.
pub type Psn = u32;

/// Local key (LKey) is a [`u32`] that identifies a local memory region.
pub type LKey = u32;

/// Remote key (RKey) is a [`u32`] that identifies a remote memory region.
pub type RKey = u32;

/// Work request identifier (WrId) is a [`u64`] chosen by the caller and echoed
/// in the matching work completion.
pub type WrId = u64;
