use bytes::Bytes;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("operation timed out")]
    Timeout,

    #[error("aborted by caller callback")]
    Aborted,

    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),

    #[error("ARP resolution failed for {0}")]
    ArpFailure(Ipv4Addr),

    #[error("checksum mismatch")]
    Checksum,

    #[error("datagram needs fragmentation but do-not-fragment was requested")]
    FragmentForbidden,

    #[error("receive buffer too small ({needed} bytes needed)")]
    BufferTooSmall { needed: usize },

    #[error("datagram too large ({0} bytes)")]
    PacketTooLarge(usize),

    #[error("ICMP error from network: type {icmp_type}, code {code}")]
    Icmp {
        icmp_type: u8,
        code: u8,
        /// The ICMP message as received, for the caller to inspect.
        packet: Bytes,
    },

    #[error("invalid parameter: {0}")]
    InvalidInput(&'static str),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("network device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
