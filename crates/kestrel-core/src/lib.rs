//! Shared leaf types for the Kestrel network-boot client stack.

mod types;

pub use types::*;

/// Largest IPv4 datagram we will build or reassemble (RFC 791 limit).
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Ethertype for IPv4 frames.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Ethertype for ARP frames.
pub const ETHERTYPE_ARP: u16 = 0x0806;
