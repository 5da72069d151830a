use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// MAC address representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// RFC 1112 mapping from an IPv4 multicast group to its link-layer
    /// address: 01:00:5e followed by the low 23 bits of the group.
    pub fn for_multicast(group: Ipv4Addr) -> Self {
        let ip = group.octets();
        Self([0x01, 0x00, 0x5e, ip[1] & 0x7f, ip[2], ip[3]])
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::str::FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.replace([':', '-'], "");
        if s.len() != 12 {
            anyhow::bail!("Invalid MAC address length");
        }

        let mut bytes = [0u8; 6];
        for i in 0..6 {
            bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }

        Ok(MacAddress(bytes))
    }
}

/// Byte-wise `(ip1 ^ ip2) & mask == 0`: true when both addresses fall on
/// the same subnet under `mask`.
pub fn on_same_subnet(ip1: Ipv4Addr, ip2: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let a = ip1.octets();
    let b = ip2.octets();
    let m = mask.octets();
    (0..4).all(|i| (a[i] ^ b[i]) & m[i] == 0)
}

/// The all-ones limited broadcast address.
pub fn is_limited_broadcast(ip: Ipv4Addr) -> bool {
    ip == Ipv4Addr::BROADCAST
}
