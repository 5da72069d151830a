//! Test doubles: a scripted NIC, static ARP/IGMP collaborators, and raw
//! frame builders. Used by this crate's integration tests and by the
//! transfer-engine crates to script peer behavior without a network.

use bytes::{BufMut, Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use kestrel_core::{ETHERTYPE_IPV4, MacAddress};

use crate::arp::ArpService;
use crate::error::Result;
use crate::igmp::IgmpService;
use crate::ipv4::{IPV4_HEADER_LEN, Ipv4Header, PROTO_UDP};
use crate::nic::{InterruptSummary, LinkStation, Nic, ReceiveFilters, RxFrame, TxDisposition};
use crate::udp::{UDP_HEADER_LEN, udp_checksum};

/// A frame recorded by [`ScriptedNic::transmit`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub dest: MacAddress,
    pub ethertype: u16,
    pub payload: Bytes,
}

type Responder = Box<dyn FnMut(&SentFrame) -> Vec<RxFrame>>;

/// NIC double: inbound frames come from a queue (or a responder closure
/// reacting to transmits), outbound frames are recorded.
pub struct ScriptedNic {
    mac: MacAddress,
    max_frame_len: usize,
    pub inbound: VecDeque<RxFrame>,
    pub sent: Vec<SentFrame>,
    responder: Option<Responder>,
    pub filters: Option<ReceiveFilters>,
    busy_budget: u32,
    interrupts: InterruptSummary,
}

impl ScriptedNic {
    pub fn new() -> Self {
        Self {
            mac: MacAddress::new([0x02, 0, 0, 0, 0, 0x01]),
            max_frame_len: 1514,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            responder: None,
            filters: None,
            busy_budget: 0,
            interrupts: InterruptSummary::default(),
        }
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Install a closure that produces reply frames for each transmit.
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn push_frame(&mut self, frame: RxFrame) {
        self.inbound.push_back(frame);
    }

    /// Report `Busy` for the next `n` transmit attempts.
    pub fn refuse_transmits(&mut self, n: u32) {
        self.busy_budget = n;
    }
}

impl Default for ScriptedNic {
    fn default() -> Self {
        Self::new()
    }
}

impl Nic for ScriptedNic {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn transmit(
        &mut self,
        dest: MacAddress,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<TxDisposition> {
        if self.busy_budget > 0 {
            self.busy_budget -= 1;
            return Ok(TxDisposition::Busy);
        }
        let frame = SentFrame {
            dest,
            ethertype,
            payload: Bytes::copy_from_slice(payload),
        };
        if let Some(responder) = self.responder.as_mut() {
            for reply in responder(&frame) {
                self.inbound.push_back(reply);
            }
        }
        self.sent.push(frame);
        self.interrupts.transmit = true;
        Ok(TxDisposition::Queued)
    }

    fn reclaim_transmit(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn take_interrupts(&mut self) -> Result<InterruptSummary> {
        Ok(std::mem::take(&mut self.interrupts))
    }

    fn poll_receive(&mut self) -> Result<Option<RxFrame>> {
        Ok(self.inbound.pop_front())
    }

    fn set_receive_filters(&mut self, filters: &ReceiveFilters) -> Result<()> {
        self.filters = Some(filters.clone());
        Ok(())
    }
}

/// ARP double mapping every address to one MAC; never sends.
pub struct StaticArp {
    pub mac: MacAddress,
}

impl StaticArp {
    pub fn new() -> Self {
        Self {
            mac: MacAddress::new([0x0a, 0, 0, 0, 0, 0x99]),
        }
    }
}

impl Default for StaticArp {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpService for StaticArp {
    fn lookup(&mut self, _target: Ipv4Addr) -> Option<MacAddress> {
        Some(self.mac)
    }

    fn resolve(
        &mut self,
        _nic: &mut dyn Nic,
        _station: LinkStation,
        _target: Ipv4Addr,
        _timeout: Duration,
    ) -> Result<MacAddress> {
        Ok(self.mac)
    }

    fn handle_frame(
        &mut self,
        _nic: &mut dyn Nic,
        _station: LinkStation,
        _frame: &RxFrame,
    ) -> Result<()> {
        Ok(())
    }
}

/// IGMP double recording membership changes; never sends.
#[derive(Default)]
pub struct RecordingIgmp {
    pub joined: Vec<Ipv4Addr>,
    pub left: Vec<Ipv4Addr>,
}

impl IgmpService for RecordingIgmp {
    fn join(&mut self, _nic: &mut dyn Nic, _station: LinkStation, group: Ipv4Addr) -> Result<()> {
        self.joined.push(group);
        Ok(())
    }

    fn leave(&mut self, _nic: &mut dyn Nic, _station: LinkStation, group: Ipv4Addr) -> Result<()> {
        self.left.push(group);
        Ok(())
    }

    fn check_timers(&mut self, _nic: &mut dyn Nic, _station: LinkStation) -> Result<()> {
        Ok(())
    }

    fn handle_packet(&mut self, _packet: &[u8]) {}
}

/// Handle-keeping wrapper so a test can retain access to a
/// [`ScriptedNic`] after boxing it into a `Stack`.
#[derive(Clone)]
pub struct SharedNic(pub Rc<RefCell<ScriptedNic>>);

impl SharedNic {
    pub fn new(nic: ScriptedNic) -> Self {
        Self(Rc::new(RefCell::new(nic)))
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.0.borrow().sent.clone()
    }

    pub fn push_frame(&self, frame: RxFrame) {
        self.0.borrow_mut().inbound.push_back(frame);
    }

    pub fn filters(&self) -> Option<ReceiveFilters> {
        self.0.borrow().filters.clone()
    }
}

impl Nic for SharedNic {
    fn mac(&self) -> MacAddress {
        self.0.borrow().mac()
    }

    fn max_frame_len(&self) -> usize {
        self.0.borrow().max_frame_len()
    }

    fn transmit(
        &mut self,
        dest: MacAddress,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<TxDisposition> {
        self.0.borrow_mut().transmit(dest, ethertype, payload)
    }

    fn reclaim_transmit(&mut self) -> Result<bool> {
        self.0.borrow_mut().reclaim_transmit()
    }

    fn take_interrupts(&mut self) -> Result<InterruptSummary> {
        self.0.borrow_mut().take_interrupts()
    }

    fn poll_receive(&mut self) -> Result<Option<RxFrame>> {
        self.0.borrow_mut().poll_receive()
    }

    fn set_receive_filters(&mut self, filters: &ReceiveFilters) -> Result<()> {
        self.0.borrow_mut().set_receive_filters(filters)
    }
}

/// Handle-keeping wrapper for [`RecordingIgmp`].
#[derive(Clone, Default)]
pub struct SharedIgmp(pub Rc<RefCell<RecordingIgmp>>);

impl SharedIgmp {
    pub fn joined(&self) -> Vec<Ipv4Addr> {
        self.0.borrow().joined.clone()
    }

    pub fn left(&self) -> Vec<Ipv4Addr> {
        self.0.borrow().left.clone()
    }
}

impl IgmpService for SharedIgmp {
    fn join(&mut self, nic: &mut dyn Nic, station: LinkStation, group: Ipv4Addr) -> Result<()> {
        self.0.borrow_mut().join(nic, station, group)
    }

    fn leave(&mut self, nic: &mut dyn Nic, station: LinkStation, group: Ipv4Addr) -> Result<()> {
        self.0.borrow_mut().leave(nic, station, group)
    }

    fn check_timers(&mut self, nic: &mut dyn Nic, station: LinkStation) -> Result<()> {
        self.0.borrow_mut().check_timers(nic, station)
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        self.0.borrow_mut().handle_packet(packet);
    }
}

/// Source MAC used for frames built by the helpers below.
pub fn peer_mac() -> MacAddress {
    MacAddress::new([0x0a, 0, 0, 0, 0, 0x99])
}

/// Build a complete single-fragment UDP frame, checksum stamped.
pub fn udp_frame(src: (Ipv4Addr, u16), dest: (Ipv4Addr, u16), payload: &[u8]) -> RxFrame {
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    let mut header = BytesMut::with_capacity(UDP_HEADER_LEN);
    header.put_u16(src.1);
    header.put_u16(dest.1);
    header.put_u16(udp_len);
    header.put_u16(0);
    let cksum = udp_checksum(src.0, dest.0, &header, payload);
    header[6..8].copy_from_slice(&cksum.to_be_bytes());

    let mut datagram = BytesMut::with_capacity(UDP_HEADER_LEN + payload.len());
    datagram.put_slice(&header);
    datagram.put_slice(payload);
    raw_ipv4_frame(src.0, dest.0, PROTO_UDP, 0x1000, 0, false, &datagram)
}

/// Build one raw IPv4 fragment frame. `offset` is in bytes and must be
/// 8-byte aligned when `more` is set.
pub fn raw_ipv4_frame(
    src: Ipv4Addr,
    dest: Ipv4Addr,
    protocol: u8,
    ident: u16,
    offset: u16,
    more: bool,
    chunk: &[u8],
) -> RxFrame {
    let header = Ipv4Header {
        src,
        dest,
        protocol,
        ttl: 16,
        tos: 0,
        ident,
        dont_fragment: false,
        more_fragments: more,
        fragment_offset: offset,
        total_len: (IPV4_HEADER_LEN + chunk.len()) as u16,
    };
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + chunk.len());
    header.encode_into(&mut buf);
    buf.put_slice(chunk);

    let dest_mac = if dest.is_multicast() {
        MacAddress::for_multicast(dest)
    } else {
        MacAddress::BROADCAST
    };
    RxFrame {
        dest: dest_mac,
        src: peer_mac(),
        ethertype: ETHERTYPE_IPV4,
        payload: buf.freeze(),
    }
}

/// A transmitted frame parsed back to its UDP addressing and payload.
#[derive(Debug, Clone)]
pub struct SentUdp {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    pub payload: Bytes,
}

/// Parse a recorded frame as a single-fragment UDP datagram.
pub fn parse_udp(frame: &SentFrame) -> Option<SentUdp> {
    if frame.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let (hdr, hlen) = Ipv4Header::parse(&frame.payload).ok()?;
    if hdr.protocol != PROTO_UDP || hdr.fragment_offset != 0 || hdr.more_fragments {
        return None;
    }
    let data = frame.payload.slice(hlen..hdr.total_len as usize);
    if data.len() < UDP_HEADER_LEN {
        return None;
    }
    Some(SentUdp {
        src_ip: hdr.src,
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dest_ip: hdr.dest,
        dest_port: u16::from_be_bytes([data[2], data[3]]),
        payload: data.slice(UDP_HEADER_LEN..),
    })
}
