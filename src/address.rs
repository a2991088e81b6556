//! Interface Addressing
//!
//! Every endpoint on the bus is identified by a 64-bit [`IfcAddr`]. The low
//! [`INTERFACE_ADDR_SIZE`] bits select an interface within a host; the
//! remaining high bits identify the host (router) within the tree.
//!
//! ```text
//!  63                                   24 23                  0
//! [ network prefix | subnet | host id   ][ interface id        ]
//! ```
//!
//! An address whose host bits are zero is *local*: it is interpreted relative
//! to the router that is looking at it. Address `0` is the loopback address
//! used for self-messages.

use std::fmt;

/// Number of low-order bits that identify an interface within a host.
pub const INTERFACE_ADDR_SIZE: u32 = 24;

/// Mask selecting the interface bits of an address.
pub const INTERFACE_MASK: u64 = (1 << INTERFACE_ADDR_SIZE) - 1;

/// Mask selecting the host bits of an address.
pub const HOST_MASK: u64 = !INTERFACE_MASK;

/// Lowest host bit. A router's own host address is its network address with
/// this bit set, which is why subnet sequence zero is never delegated.
pub const INTERFACE_BIT: u64 = 1 << INTERFACE_ADDR_SIZE;

/// Number of address bits available for network prefixes.
pub const HOST_ADDR_BITS: u32 = 64 - INTERFACE_ADDR_SIZE;

/// A 64-bit interface address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfcAddr(u64);

impl IfcAddr {
    /// The loopback (self) address.
    pub const LOOPBACK: IfcAddr = IfcAddr(0);

    /// Create from a raw 64-bit value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Compose an address from a host address and an interface id.
    pub const fn compose(host: IfcAddr, interface: u64) -> Self {
        Self((host.0 & HOST_MASK) | (interface & INTERFACE_MASK))
    }

    /// Get the raw value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The host part, with interface bits cleared.
    pub const fn host(&self) -> IfcAddr {
        IfcAddr(self.0 & HOST_MASK)
    }

    /// The interface part, with host bits cleared.
    pub const fn interface(&self) -> IfcAddr {
        IfcAddr(self.0 & INTERFACE_MASK)
    }

    /// Check if the address is local (host bits are zero).
    pub const fn is_local(&self) -> bool {
        self.0 & HOST_MASK == 0
    }

    /// Check if the address belongs to the given host.
    pub const fn is_host(&self, host: IfcAddr) -> bool {
        self.0 & HOST_MASK == host.0 & HOST_MASK
    }

    /// Check if the address lies inside `net` under `mask`.
    pub const fn is_on_network(&self, net: IfcAddr, mask: u64) -> bool {
        self.0 & mask == net.0 & mask
    }

    /// Check if this is the loopback address.
    pub const fn is_loopback(&self) -> bool {
        self.0 == 0
    }

    /// Big-endian byte representation.
    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Create from big-endian bytes.
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl From<u64> for IfcAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<IfcAddr> for u64 {
    fn from(addr: IfcAddr) -> Self {
        addr.0
    }
}

impl fmt::Display for IfcAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}:{:06x}", self.0 >> INTERFACE_ADDR_SIZE, self.0 & INTERFACE_MASK)
    }
}

// ============================================================================
// Free functions
// ============================================================================

/// Host part of `addr`.
pub const fn host_of(addr: IfcAddr) -> IfcAddr {
    addr.host()
}

/// Interface part of `addr`.
pub const fn interface_of(addr: IfcAddr) -> IfcAddr {
    addr.interface()
}

/// Whether `addr` belongs to `candidate_host`.
pub const fn is_host(addr: IfcAddr, candidate_host: IfcAddr) -> bool {
    addr.is_host(candidate_host)
}

/// Whether `addr` is local (zero host bits).
pub const fn is_local(addr: IfcAddr) -> bool {
    addr.is_local()
}

/// Whether `addr` lies inside `net` under `mask`.
pub const fn is_on_network(addr: IfcAddr, net: IfcAddr, mask: u64) -> bool {
    addr.is_on_network(net, mask)
}

/// Network mask for a prefix of `prefix_len` high-order bits.
pub const fn network_mask(prefix_len: u8) -> u64 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 64 {
        u64::MAX
    } else {
        u64::MAX << (64 - prefix_len as u32)
    }
}
