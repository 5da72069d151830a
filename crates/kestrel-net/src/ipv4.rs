//! IPv4 engine: header codec, route table, destination filter policy,
//! fragmenting transmit, and reassembling receive.
//!
//! Receive supports exactly one reassembly in flight per call: fragments
//! carrying any other identification or source are ignored, not buffered.

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use kestrel_core::{ETHERTYPE_IPV4, MAX_DATAGRAM_SIZE, MacAddress, is_limited_broadcast, on_same_subnet};

use crate::checksum::checksum16;
use crate::error::{NetError, Result};
use crate::nic::ProgressFn;
use crate::stack::Stack;

pub const IPV4_HEADER_LEN: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_IGMP: u8 = 2;
pub const PROTO_UDP: u8 = 17;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;

/// Parsed/parameterized IPv4 header. `fragment_offset` is in bytes; the
/// codec converts to and from the wire's 8-byte units.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub tos: u8,
    pub ident: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub total_len: u16,
}

impl Ipv4Header {
    /// Append the 20-byte header, checksum stamped.
    pub fn encode_into(&self, out: &mut BytesMut) {
        let start = out.len();
        out.put_u8(0x45); // version 4, 5-word header
        out.put_u8(self.tos);
        out.put_u16(self.total_len);
        out.put_u16(self.ident);
        let mut flags_frag = self.fragment_offset / 8;
        if self.dont_fragment {
            flags_frag |= FLAG_DONT_FRAGMENT;
        }
        if self.more_fragments {
            flags_frag |= FLAG_MORE_FRAGMENTS;
        }
        out.put_u16(flags_frag);
        out.put_u8(self.ttl);
        out.put_u8(self.protocol);
        out.put_u16(0); // checksum placeholder
        out.put_slice(&self.src.octets());
        out.put_slice(&self.dest.octets());

        let cksum = checksum16(&out[start..start + IPV4_HEADER_LEN]);
        out[start + 10..start + 12].copy_from_slice(&cksum.to_be_bytes());
    }

    /// Parse and verify a header; returns the header and its length
    /// (options included).
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(NetError::Malformed("short IPv4 header"));
        }
        if buf[0] >> 4 != 4 {
            return Err(NetError::Malformed("not IPv4"));
        }
        let header_len = ((buf[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || buf.len() < header_len {
            return Err(NetError::Malformed("bad IPv4 header length"));
        }
        if checksum16(&buf[..header_len]) != 0 {
            return Err(NetError::Checksum);
        }

        let total_len = u16::from_be_bytes([buf[2], buf[3]]);
        if (total_len as usize) < header_len || (total_len as usize) > buf.len() {
            return Err(NetError::Malformed("bad IPv4 total length"));
        }
        let flags_frag = u16::from_be_bytes([buf[6], buf[7]]);

        Ok((
            Self {
                src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
                dest: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
                protocol: buf[9],
                ttl: buf[8],
                tos: buf[1],
                ident: u16::from_be_bytes([buf[4], buf[5]]),
                dont_fragment: flags_frag & FLAG_DONT_FRAGMENT != 0,
                more_fragments: flags_frag & FLAG_MORE_FRAGMENTS != 0,
                fragment_offset: (flags_frag & 0x1fff) * 8,
                total_len,
            },
            header_len,
        ))
    }
}

pub const MAX_ROUTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub subnet: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Capacity-bounded on-link route table. Additions are best effort:
/// off-link gateways, duplicates, and overflow are silently ignored.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn add(&mut self, entry: RouteEntry, station_ip: Ipv4Addr, station_mask: Ipv4Addr) {
        if !on_same_subnet(entry.gateway, station_ip, station_mask) {
            trace!(gateway = %entry.gateway, "route gateway not on-link, ignored");
            return;
        }
        if self.entries.len() >= MAX_ROUTES || self.entries.contains(&entry) {
            return;
        }
        debug!(gateway = %entry.gateway, subnet = %entry.subnet, "route learned");
        self.entries.push(entry);
    }

    /// First entry whose recorded subnet matches the destination.
    pub fn route_for(&self, dest: Ipv4Addr) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|e| on_same_subnet(dest, e.subnet, e.mask))
            .map(|e| e.gateway)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub const MAX_MULTICAST_GROUPS: usize = 8;

/// Destination filter policy for inbound datagrams.
#[derive(Debug, Clone)]
pub struct IpFilter {
    pub station: bool,
    pub broadcast: bool,
    pub promiscuous: bool,
    pub promiscuous_multicast: bool,
    /// Multicast groups accepted (and joined); at most
    /// [`MAX_MULTICAST_GROUPS`].
    pub groups: Vec<Ipv4Addr>,
}

impl Default for IpFilter {
    fn default() -> Self {
        Self {
            station: true,
            broadcast: false,
            promiscuous: false,
            promiscuous_multicast: false,
            groups: Vec::new(),
        }
    }
}

impl IpFilter {
    pub fn accepts(&self, station_ip: Ipv4Addr, station_mask: Ipv4Addr, dest: Ipv4Addr) -> bool {
        if self.promiscuous {
            return true;
        }
        if dest.is_multicast() {
            return self.promiscuous_multicast || self.groups.contains(&dest);
        }
        if is_limited_broadcast(dest) || is_directed_broadcast(dest, station_ip, station_mask) {
            return self.broadcast;
        }
        self.station && dest == station_ip
    }
}

fn is_directed_broadcast(dest: Ipv4Addr, station_ip: Ipv4Addr, mask: Ipv4Addr) -> bool {
    if station_ip.is_unspecified() || mask == Ipv4Addr::UNSPECIFIED {
        return false;
    }
    let d = u32::from(dest);
    let m = u32::from(mask);
    d & m == u32::from(station_ip) & m && d | m == u32::MAX
}

/// Parameters for an outbound datagram.
#[derive(Debug, Clone, Copy)]
pub struct SendSpec {
    pub dest: Ipv4Addr,
    /// Source address; defaults to the station IP.
    pub src: Option<Ipv4Addr>,
    pub protocol: u8,
    /// Explicit next-hop override.
    pub gateway: Option<Ipv4Addr>,
    pub dont_fragment: bool,
}

impl SendSpec {
    pub fn new(dest: Ipv4Addr, protocol: u8) -> Self {
        Self {
            dest,
            src: None,
            protocol,
            gateway: None,
            dont_fragment: false,
        }
    }
}

/// Inbound match criteria. `None` fields are wildcards; a `None`
/// destination applies the session's filter policy.
#[derive(Debug, Clone, Copy)]
pub struct RecvSpec {
    pub protocol: u8,
    pub src: Option<Ipv4Addr>,
    pub dest: Option<Ipv4Addr>,
}

/// Result of a completed receive.
#[derive(Debug, Clone, Copy)]
pub struct RecvInfo {
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub l4_header_len: usize,
    pub payload_len: usize,
}

/// Per-datagram reassembly bookkeeping. Only fragments matching the
/// first-seen identification and source are accepted.
#[derive(Debug)]
struct Reassembly {
    ident: u16,
    src: Ipv4Addr,
    dest: Ipv4Addr,
    received: usize,
    total: Option<usize>,
    first_seen: bool,
    last_seen: bool,
}

impl Reassembly {
    fn new(ident: u16, src: Ipv4Addr, dest: Ipv4Addr) -> Self {
        Self {
            ident,
            src,
            dest,
            received: 0,
            total: None,
            first_seen: false,
            last_seen: false,
        }
    }
}

/// ICMP message types that surface to the caller as transport errors.
/// Everything else (echo, router advertisement, ...) is dropped.
fn is_icmp_error(icmp_type: u8) -> bool {
    matches!(icmp_type, 3 | 4 | 11 | 12)
}

impl Stack {
    pub fn add_route(&mut self, entry: RouteEntry) {
        let (ip, mask) = (self.cfg.station_ip, self.cfg.subnet_mask);
        self.routes.add(entry, ip, mask);
    }

    /// Learn a default route through `gateway` (best effort).
    pub fn add_gateway(&mut self, gateway: Ipv4Addr) {
        self.add_route(RouteEntry {
            subnet: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            gateway,
        });
    }

    pub fn route_for(&self, dest: Ipv4Addr) -> Option<Ipv4Addr> {
        self.routes.route_for(dest)
    }

    fn resolve_dest_mac(&mut self, dest: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Result<MacAddress> {
        let station = self.station();
        let mask = self.cfg.subnet_mask;

        if is_limited_broadcast(dest) || is_directed_broadcast(dest, station.ip, mask) {
            return Ok(MacAddress::BROADCAST);
        }
        if dest.is_multicast() {
            return Ok(MacAddress::for_multicast(dest));
        }

        let next_hop = if on_same_subnet(dest, station.ip, mask) {
            dest
        } else if let Some(gw) = gateway {
            gw
        } else if let Some(gw) = self.routes.route_for(dest) {
            gw
        } else if let Some(gw) = self.cfg.gateway {
            gw
        } else {
            return Err(NetError::NoRoute(dest));
        };

        if let Some(mac) = self.arp.lookup(next_hop) {
            return Ok(mac);
        }
        if !self.cfg.auto_arp {
            // Without active ARP an uncached next hop is unreachable.
            return Err(NetError::NoRoute(dest));
        }
        self.arp
            .resolve(self.nic.as_mut(), station, next_hop, self.cfg.arp_timeout)
    }

    /// Largest IP payload that fits one frame, rounded down to the 8-byte
    /// fragment granularity.
    fn link_payload_limit(&self) -> usize {
        let limit = self.nic.max_frame_len() - self.nic.media_header_len() - IPV4_HEADER_LEN;
        limit & !7
    }

    /// Transmit a datagram, fragmenting when it exceeds one link frame.
    /// `l4_header` is laid out immediately before `payload` (typically the
    /// UDP header); both together form the IP payload.
    pub fn send_fragmented(&mut self, spec: &SendSpec, l4_header: &[u8], payload: &[u8]) -> Result<()> {
        let total = l4_header.len() + payload.len();
        if total + IPV4_HEADER_LEN > MAX_DATAGRAM_SIZE {
            return Err(NetError::PacketTooLarge(total));
        }

        let dest_mac = self.resolve_dest_mac(spec.dest, spec.gateway)?;
        let limit = self.link_payload_limit();
        if total > limit && spec.dont_fragment {
            return Err(NetError::FragmentForbidden);
        }

        let src = spec.src.unwrap_or(self.cfg.station_ip);
        let ident = self.next_ident();
        let (ttl, tos) = (self.cfg.ttl, self.cfg.tos);

        self.tx_buf.clear();
        self.tx_buf.reserve(total);
        self.tx_buf.put_slice(l4_header);
        self.tx_buf.put_slice(payload);

        let mut offset = 0usize;
        while offset < total || (total == 0 && offset == 0) {
            let chunk_len = (total - offset).min(limit);
            let more = offset + chunk_len < total;

            let header = Ipv4Header {
                src,
                dest: spec.dest,
                protocol: spec.protocol,
                ttl,
                tos,
                ident,
                dont_fragment: spec.dont_fragment,
                more_fragments: more,
                fragment_offset: offset as u16,
                total_len: (IPV4_HEADER_LEN + chunk_len) as u16,
            };

            let mut frame = BytesMut::with_capacity(IPV4_HEADER_LEN + chunk_len);
            header.encode_into(&mut frame);
            frame.put_slice(&self.tx_buf[offset..offset + chunk_len]);
            trace!(dest = %spec.dest, ident, offset, chunk_len, more, "transmit IPv4");
            self.pump.send(
                self.nic.as_mut(),
                dest_mac,
                ETHERTYPE_IPV4,
                &frame,
                self.progress.as_mut().map(|p| &mut **p as &mut ProgressFn),
            )?;

            offset += chunk_len;
            if chunk_len == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Receive one datagram matching `spec`, reassembling fragments.
    ///
    /// The first `l4_header.len()` bytes of the datagram are copied into
    /// `l4_header` (the protocol sub-header); the rest lands in `payload`.
    /// Overflowing `payload` is fatal ([`NetError::BufferTooSmall`]).
    pub fn ip_receive(
        &mut self,
        spec: &RecvSpec,
        l4_header: &mut [u8],
        payload: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<RecvInfo> {
        let station = self.station();
        let mask = self.cfg.subnet_mask;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut reassembly: Option<Reassembly> = None;

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

            let frame = self.pump.receive(
                self.nic.as_mut(),
                self.arp.as_mut(),
                self.igmp.as_mut(),
                station,
                remaining,
                self.progress.as_mut().map(|p| &mut **p as &mut ProgressFn),
            )?;

            if frame.ethertype != ETHERTYPE_IPV4 {
                continue;
            }
            let (hdr, hlen) = match Ipv4Header::parse(&frame.payload) {
                Ok(parsed) => parsed,
                Err(err) => {
                    trace!(%err, "dropping bad IPv4 frame");
                    continue;
                }
            };
            let data = &frame.payload[hlen..hdr.total_len as usize];

            let dest_ok = match spec.dest {
                Some(d) => hdr.dest == d,
                None => self.filter.accepts(station.ip, mask, hdr.dest),
            };

            if hdr.protocol == PROTO_ICMP {
                if dest_ok && data.len() >= 2 && is_icmp_error(data[0]) {
                    warn!(icmp_type = data[0], code = data[1], src = %hdr.src, "ICMP error received");
                    return Err(NetError::Icmp {
                        icmp_type: data[0],
                        code: data[1],
                        packet: frame.payload.slice(hlen..hdr.total_len as usize),
                    });
                }
                continue;
            }
            if hdr.protocol == PROTO_IGMP {
                self.igmp.handle_packet(data);
                continue;
            }

            if hdr.protocol != spec.protocol || !dest_ok {
                continue;
            }
            if let Some(src) = spec.src
                && src != hdr.src
            {
                continue;
            }

            // Fragment accounting: one datagram in flight, keyed by
            // identification and source.
            if let Some(r) = reassembly.as_ref()
                && (r.ident != hdr.ident || r.src != hdr.src)
            {
                trace!(ident = hdr.ident, "fragment of foreign datagram ignored");
                continue;
            }
            let r = reassembly
                .get_or_insert_with(|| Reassembly::new(hdr.ident, hdr.src, hdr.dest));

            let offset = hdr.fragment_offset as usize;
            let end = offset + data.len();
            let l4h = l4_header.len();

            if offset < l4h {
                let head = l4h.min(end) - offset;
                l4_header[offset..offset + head].copy_from_slice(&data[..head]);
                if end > l4h {
                    let rest = &data[head..];
                    if rest.len() > payload.len() {
                        return Err(NetError::BufferTooSmall { needed: end - l4h });
                    }
                    payload[..rest.len()].copy_from_slice(rest);
                }
            } else {
                let pstart = offset - l4h;
                let pend = pstart + data.len();
                if pend > payload.len() {
                    return Err(NetError::BufferTooSmall { needed: pend });
                }
                payload[pstart..pend].copy_from_slice(data);
            }

            r.received += data.len();
            if offset == 0 {
                r.first_seen = true;
            }
            if !hdr.more_fragments {
                r.last_seen = true;
                r.total = Some(end);
            }

            if r.first_seen
                && r.last_seen
                && let Some(total) = r.total
                && r.received >= total
            {
                let l4_used = l4h.min(total);
                return Ok(RecvInfo {
                    src: r.src,
                    dest: r.dest,
                    l4_header_len: l4_used,
                    payload_len: total - l4_used,
                });
            }
            debug!(
                ident = hdr.ident,
                offset,
                received = r.received,
                "fragment accepted, datagram incomplete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Ipv4Header {
            src: Ipv4Addr::new(192, 168, 1, 2),
            dest: Ipv4Addr::new(192, 168, 1, 10),
            protocol: PROTO_UDP,
            ttl: 16,
            tos: 0,
            ident: 0xbeef,
            dont_fragment: false,
            more_fragments: true,
            fragment_offset: 1480,
            total_len: 1500,
        };
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        // Padding so total_len is not larger than the buffer.
        buf.resize(1500, 0);

        let (parsed, hlen) = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(hlen, IPV4_HEADER_LEN);
        assert_eq!(parsed.src, header.src);
        assert_eq!(parsed.dest, header.dest);
        assert_eq!(parsed.ident, 0xbeef);
        assert!(parsed.more_fragments);
        assert_eq!(parsed.fragment_offset, 1480);
    }

    #[test]
    fn corrupted_header_fails_checksum() {
        let header = Ipv4Header {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dest: Ipv4Addr::new(10, 0, 0, 2),
            protocol: PROTO_UDP,
            ttl: 16,
            tos: 0,
            ident: 1,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            total_len: 20,
        };
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        buf[8] ^= 0xff;
        assert!(matches!(Ipv4Header::parse(&buf), Err(NetError::Checksum)));
    }

    #[test]
    fn route_table_rejects_off_link_duplicates_and_overflow() {
        let station = Ipv4Addr::new(192, 168, 1, 2);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let mut table = RouteTable::default();

        let entry = RouteEntry {
            subnet: Ipv4Addr::new(10, 0, 0, 0),
            mask: Ipv4Addr::new(255, 0, 0, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        };
        table.add(entry, station, mask);
        assert_eq!(table.len(), 1);

        // Duplicate silently ignored.
        table.add(entry, station, mask);
        assert_eq!(table.len(), 1);

        // Off-link gateway silently ignored.
        table.add(
            RouteEntry {
                subnet: Ipv4Addr::new(172, 16, 0, 0),
                mask: Ipv4Addr::new(255, 240, 0, 0),
                gateway: Ipv4Addr::new(192, 168, 9, 1),
            },
            station,
            mask,
        );
        assert_eq!(table.len(), 1);

        for i in 0..MAX_ROUTES as u8 {
            table.add(
                RouteEntry {
                    subnet: Ipv4Addr::new(10, i, 0, 0),
                    mask: Ipv4Addr::new(255, 255, 0, 0),
                    gateway: Ipv4Addr::new(192, 168, 1, 1),
                },
                station,
                mask,
            );
        }
        assert_eq!(table.len(), MAX_ROUTES);

        assert_eq!(
            table.route_for(Ipv4Addr::new(10, 1, 2, 3)),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(table.route_for(Ipv4Addr::new(172, 16, 1, 1)), None);
    }

    #[test]
    fn filter_policy_modes() {
        let station = Ipv4Addr::new(192, 168, 1, 2);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let group = Ipv4Addr::new(224, 0, 1, 1);

        let default = IpFilter::default();
        assert!(default.accepts(station, mask, station));
        assert!(!default.accepts(station, mask, Ipv4Addr::BROADCAST));
        assert!(!default.accepts(station, mask, group));

        let bcast = IpFilter {
            broadcast: true,
            ..IpFilter::default()
        };
        assert!(bcast.accepts(station, mask, Ipv4Addr::BROADCAST));
        // Subnet-directed broadcast counts too.
        assert!(bcast.accepts(station, mask, Ipv4Addr::new(192, 168, 1, 255)));

        let member = IpFilter {
            groups: vec![group],
            ..IpFilter::default()
        };
        assert!(member.accepts(station, mask, group));
        assert!(!member.accepts(station, mask, Ipv4Addr::new(224, 0, 1, 2)));

        let promisc_mcast = IpFilter {
            promiscuous_multicast: true,
            ..IpFilter::default()
        };
        assert!(promisc_mcast.accepts(station, mask, Ipv4Addr::new(224, 9, 9, 9)));
        assert!(!promisc_mcast.accepts(station, mask, Ipv4Addr::new(192, 168, 1, 77)));

        let promisc = IpFilter {
            promiscuous: true,
            ..IpFilter::default()
        };
        assert!(promisc.accepts(station, mask, Ipv4Addr::new(8, 8, 8, 8)));
    }
}
