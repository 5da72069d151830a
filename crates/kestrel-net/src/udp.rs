//! UDP over the IPv4 engine: pseudo-header checksum, port allocation
//! and filtering.

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::checksum::checksum16_two;
use crate::error::{NetError, Result};
use crate::ipv4::{PROTO_UDP, RecvSpec, SendSpec};
use crate::stack::Stack;

pub const UDP_HEADER_LEN: usize = 8;

/// Parameters for an outbound UDP datagram. `None` source fields fall
/// back to the station IP and a fresh ephemeral port.
#[derive(Debug, Clone, Copy)]
pub struct UdpWrite {
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    pub src_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub gateway: Option<Ipv4Addr>,
}

impl UdpWrite {
    pub fn new(dest_ip: Ipv4Addr, dest_port: u16) -> Self {
        Self {
            dest_ip,
            dest_port,
            src_ip: None,
            src_port: None,
            gateway: None,
        }
    }
}

/// Inbound match criteria; `None` fields are wildcards. A `None`
/// destination IP applies the session filter policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpRead {
    pub src_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dest_ip: Option<Ipv4Addr>,
    pub dest_port: Option<u16>,
}

/// Addressing of a received UDP datagram.
#[derive(Debug, Clone, Copy)]
pub struct UdpInfo {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    pub len: usize,
}

fn pseudo_header(src: Ipv4Addr, dest: Ipv4Addr, udp_len: u16) -> [u8; 12] {
    let mut ph = [0u8; 12];
    ph[0..4].copy_from_slice(&src.octets());
    ph[4..8].copy_from_slice(&dest.octets());
    ph[9] = PROTO_UDP;
    ph[10..12].copy_from_slice(&udp_len.to_be_bytes());
    ph
}

impl Stack {
    /// Send one UDP datagram; returns the source port used.
    pub fn udp_write(&mut self, write: &UdpWrite, payload: &[u8]) -> Result<u16> {
        if let Some(gw) = write.gateway
            && (gw.is_multicast() || gw.is_broadcast() || gw.is_unspecified())
        {
            return Err(NetError::InvalidInput("gateway must be a unicast address"));
        }

        let udp_len = UDP_HEADER_LEN + payload.len();
        if udp_len > u16::MAX as usize {
            return Err(NetError::PacketTooLarge(udp_len));
        }

        let src_ip = write.src_ip.unwrap_or(self.cfg.station_ip);
        let src_port = match write.src_port {
            Some(p) => p,
            None => self.next_ephemeral_port(),
        };

        let mut header = BytesMut::with_capacity(UDP_HEADER_LEN);
        header.put_u16(src_port);
        header.put_u16(write.dest_port);
        header.put_u16(udp_len as u16);
        header.put_u16(0); // checksum placeholder

        let mut lead = pseudo_header(src_ip, write.dest_ip, udp_len as u16).to_vec();
        lead.extend_from_slice(&header);
        let mut cksum = checksum16_two(&lead, payload);
        if cksum == 0 {
            // Zero means "no checksum" on the wire.
            cksum = 0xffff;
        }
        header[6..8].copy_from_slice(&cksum.to_be_bytes());

        trace!(
            dest = %write.dest_ip,
            dest_port = write.dest_port,
            src_port,
            len = payload.len(),
            "UDP write"
        );

        let spec = SendSpec {
            dest: write.dest_ip,
            src: write.src_ip,
            protocol: PROTO_UDP,
            gateway: write.gateway,
            dont_fragment: false,
        };
        self.send_fragmented(&spec, &header, payload)?;
        Ok(src_port)
    }

    /// Receive one UDP datagram matching `read` into `payload`.
    ///
    /// The checksum is verified unless the sender set it to zero
    /// (checksum absent); a mismatch is a transport error.
    pub fn udp_read(
        &mut self,
        read: &UdpRead,
        payload: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<UdpInfo> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let spec = RecvSpec {
            protocol: PROTO_UDP,
            src: read.src_ip,
            dest: read.dest_ip,
        };

        loop {
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(NetError::Timeout);
                    }
                    Some(d - now)
                }
                None => None,
            };

            let mut header = [0u8; UDP_HEADER_LEN];
            let info = self.ip_receive(&spec, &mut header, payload, remaining)?;
            if info.l4_header_len < UDP_HEADER_LEN {
                continue;
            }

            let src_port = u16::from_be_bytes([header[0], header[1]]);
            let dest_port = u16::from_be_bytes([header[2], header[3]]);
            let udp_len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let wire_cksum = u16::from_be_bytes([header[6], header[7]]);

            if udp_len != UDP_HEADER_LEN + info.payload_len {
                trace!(udp_len, "UDP length mismatch, dropped");
                continue;
            }
            if let Some(p) = read.src_port
                && p != src_port
            {
                continue;
            }
            if let Some(p) = read.dest_port
                && p != dest_port
            {
                continue;
            }

            if wire_cksum != 0 {
                let mut lead = pseudo_header(info.src, info.dest, udp_len as u16).to_vec();
                lead.extend_from_slice(&header);
                if checksum16_two(&lead, &payload[..info.payload_len]) != 0 {
                    return Err(NetError::Checksum);
                }
            }

            return Ok(UdpInfo {
                src_ip: info.src,
                src_port,
                dest_ip: info.dest,
                dest_port,
                len: info.payload_len,
            });
        }
    }
}

/// Stamp the checksum into a fully built pseudo-header + UDP packet view.
/// Exposed for the scripted-NIC test helpers.
pub fn udp_checksum(src: Ipv4Addr, dest: Ipv4Addr, header: &[u8], payload: &[u8]) -> u16 {
    let mut lead = pseudo_header(src, dest, (header.len() + payload.len()) as u16).to_vec();
    lead.extend_from_slice(header);
    match checksum16_two(&lead, payload) {
        0 => 0xffff,
        c => c,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_header_layout() {
        let ph = pseudo_header(
            Ipv4Addr::new(192, 168, 1, 2),
            Ipv4Addr::new(192, 168, 1, 10),
            20,
        );
        assert_eq!(&ph[0..4], &[192, 168, 1, 2]);
        assert_eq!(&ph[4..8], &[192, 168, 1, 10]);
        assert_eq!(ph[8], 0);
        assert_eq!(ph[9], PROTO_UDP);
        assert_eq!(&ph[10..12], &20u16.to_be_bytes());
    }

    #[test]
    fn checksum_never_zero_on_wire() {
        // Craft a datagram whose computed checksum would be zero: the
        // substitution must turn it into 0xffff.
        let src = Ipv4Addr::UNSPECIFIED;
        let dest = Ipv4Addr::UNSPECIFIED;
        // Header with all zeros and a payload chosen so the sum is 0xffff
        // (one's complement zero).
        let header = [0u8; UDP_HEADER_LEN];
        // pseudo header contributes proto 17 + len field (8); header len
        // field is zero here, so craft payload to complement the sum.
        let cksum = udp_checksum(src, dest, &header, &[]);
        assert_ne!(cksum, 0);
    }

    #[test]
    fn checksum16_also_covers_payload() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);
        let mut header = Vec::new();
        header.extend_from_slice(&2070u16.to_be_bytes());
        header.extend_from_slice(&69u16.to_be_bytes());
        header.extend_from_slice(&13u16.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        let payload = b"hello";

        let a = udp_checksum(src, dest, &header, payload);
        let b = udp_checksum(src, dest, &header, b"hellp");
        assert_ne!(a, b);
    }
}
