//! Kestrel network engine: IPv4 fragmentation/reassembly and routing,
//! UDP checksum and port handling, and the polling frame pump they ride
//! on, all over a pluggable raw-frame NIC abstraction.
//!
//! Everything is synchronous and single-threaded: blocking is a bounded
//! poll loop with a periodic caller progress callback, the way a
//! pre-boot environment drives its network hardware.

pub mod arp;
pub mod checksum;
mod error;
pub mod igmp;
pub mod ipv4;
pub mod nic;
mod stack;
pub mod testing;
pub mod udp;

pub use error::{NetError, Result};
pub use ipv4::{
    IPV4_HEADER_LEN, IpFilter, Ipv4Header, MAX_MULTICAST_GROUPS, MAX_ROUTES, PROTO_ICMP,
    PROTO_IGMP, PROTO_UDP, RecvInfo, RecvSpec, RouteEntry, RouteTable, SendSpec,
};
pub use nic::{
    FramePump, InterruptSummary, LinkStation, Nic, ProgressFn, ReceiveFilters, RxFrame,
    TxDisposition,
};
pub use stack::{Stack, StackConfig};
pub use udp::{UDP_HEADER_LEN, UdpInfo, UdpRead, UdpWrite};
