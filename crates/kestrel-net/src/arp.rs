//! ARP collaborator: cache lookup, active resolution, inbound handling.
//!
//! The IPv4 engine consumes this through the [`ArpService`] trait; the
//! provided [`ArpCache`] is a small bounded cache that also answers
//! requests for the station address, since nothing else on a boot client
//! will.

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use kestrel_core::{ETHERTYPE_ARP, ETHERTYPE_IPV4, MacAddress};

use crate::error::{NetError, Result};
use crate::nic::{LinkStation, Nic, RxFrame, TxDisposition};

const ARP_PACKET_LEN: usize = 28;
const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;

/// ARP resolution as consumed by the IPv4 layer.
pub trait ArpService {
    /// Cache-only lookup.
    fn lookup(&mut self, target: Ipv4Addr) -> Option<MacAddress>;

    /// Active resolution with a bounded wait. Only invoked when auto-ARP
    /// is enabled.
    fn resolve(
        &mut self,
        nic: &mut dyn Nic,
        station: LinkStation,
        target: Ipv4Addr,
        timeout: Duration,
    ) -> Result<MacAddress>;

    /// Inbound ARP frame forwarded from the frame pump.
    fn handle_frame(
        &mut self,
        nic: &mut dyn Nic,
        station: LinkStation,
        frame: &RxFrame,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddress,
}

/// Bounded ARP cache with active resolution.
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

const MAX_ARP_ENTRIES: usize = 8;
const RESOLVE_ATTEMPTS: u32 = 3;

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn learn(&mut self, ip: Ipv4Addr, mac: MacAddress) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            entry.mac = mac;
            return;
        }
        if self.entries.len() >= MAX_ARP_ENTRIES {
            // Oldest entry makes room.
            self.entries.remove(0);
        }
        trace!(%ip, %mac, "learned ARP mapping");
        self.entries.push(ArpEntry { ip, mac });
    }

    fn send(
        &self,
        nic: &mut dyn Nic,
        station: LinkStation,
        oper: u16,
        target_mac: MacAddress,
        target_ip: Ipv4Addr,
        frame_dest: MacAddress,
    ) -> Result<()> {
        let mut pkt = BytesMut::with_capacity(ARP_PACKET_LEN);
        pkt.put_u16(1); // Ethernet
        pkt.put_u16(ETHERTYPE_IPV4);
        pkt.put_u8(6);
        pkt.put_u8(4);
        pkt.put_u16(oper);
        pkt.put_slice(station.mac.as_bytes());
        pkt.put_slice(&station.ip.octets());
        pkt.put_slice(target_mac.as_bytes());
        pkt.put_slice(&target_ip.octets());

        match nic.transmit(frame_dest, ETHERTYPE_ARP, &pkt)? {
            TxDisposition::Queued => Ok(()),
            TxDisposition::Busy => Err(NetError::Device("transmit queue full".into())),
        }
    }
}

impl ArpService for ArpCache {
    fn lookup(&mut self, target: Ipv4Addr) -> Option<MacAddress> {
        self.entries.iter().find(|e| e.ip == target).map(|e| e.mac)
    }

    fn resolve(
        &mut self,
        nic: &mut dyn Nic,
        station: LinkStation,
        target: Ipv4Addr,
        timeout: Duration,
    ) -> Result<MacAddress> {
        if let Some(mac) = self.lookup(target) {
            return Ok(mac);
        }

        let per_attempt = timeout / RESOLVE_ATTEMPTS;
        for attempt in 0..RESOLVE_ATTEMPTS {
            self.send(
                nic,
                station,
                OPER_REQUEST,
                MacAddress::new([0; 6]),
                target,
                MacAddress::BROADCAST,
            )?;

            let deadline = Instant::now() + per_attempt;
            while Instant::now() < deadline {
                if let Some(frame) = nic.poll_receive()? {
                    if frame.ethertype == ETHERTYPE_ARP {
                        self.handle_frame(nic, station, &frame)?;
                        if let Some(mac) = self.lookup(target) {
                            return Ok(mac);
                        }
                    }
                    // Non-ARP traffic during resolution is dropped; the
                    // transfer layers retransmit.
                    continue;
                }
                std::thread::sleep(Duration::from_micros(100));
            }
            debug!(%target, attempt, "ARP attempt timed out");
        }

        warn!(%target, "ARP resolution failed");
        Err(NetError::ArpFailure(target))
    }

    fn handle_frame(
        &mut self,
        nic: &mut dyn Nic,
        station: LinkStation,
        frame: &RxFrame,
    ) -> Result<()> {
        let mut buf = &frame.payload[..];
        if buf.len() < ARP_PACKET_LEN {
            return Ok(());
        }
        let htype = buf.get_u16();
        let ptype = buf.get_u16();
        let hlen = buf.get_u8();
        let plen = buf.get_u8();
        if htype != 1 || ptype != ETHERTYPE_IPV4 || hlen != 6 || plen != 4 {
            return Ok(());
        }
        let oper = buf.get_u16();

        let mut sha = [0u8; 6];
        buf.copy_to_slice(&mut sha);
        let mut spa = [0u8; 4];
        buf.copy_to_slice(&mut spa);
        let sender_mac = MacAddress::new(sha);
        let sender_ip = Ipv4Addr::from(spa);

        let mut tha = [0u8; 6];
        buf.copy_to_slice(&mut tha);
        let mut tpa = [0u8; 4];
        buf.copy_to_slice(&mut tpa);
        let target_ip = Ipv4Addr::from(tpa);

        if !sender_ip.is_unspecified() {
            self.learn(sender_ip, sender_mac);
        }

        if oper == OPER_REQUEST && target_ip == station.ip {
            self.send(nic, station, OPER_REPLY, sender_mac, sender_ip, sender_mac)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply_frame(sender_ip: Ipv4Addr, sender_mac: MacAddress) -> RxFrame {
        let mut pkt = BytesMut::new();
        pkt.put_u16(1);
        pkt.put_u16(ETHERTYPE_IPV4);
        pkt.put_u8(6);
        pkt.put_u8(4);
        pkt.put_u16(OPER_REPLY);
        pkt.put_slice(sender_mac.as_bytes());
        pkt.put_slice(&sender_ip.octets());
        pkt.put_slice(&[0u8; 6]);
        pkt.put_slice(&Ipv4Addr::new(192, 168, 1, 2).octets());
        RxFrame {
            dest: MacAddress::new([0x02, 0, 0, 0, 0, 1]),
            src: sender_mac,
            ethertype: ETHERTYPE_ARP,
            payload: pkt.freeze(),
        }
    }

    struct NoopNic;
    impl Nic for NoopNic {
        fn mac(&self) -> MacAddress {
            MacAddress::new([0x02, 0, 0, 0, 0, 1])
        }
        fn max_frame_len(&self) -> usize {
            1514
        }
        fn transmit(&mut self, _: MacAddress, _: u16, _: &[u8]) -> Result<TxDisposition> {
            Ok(TxDisposition::Queued)
        }
        fn reclaim_transmit(&mut self) -> Result<bool> {
            Ok(true)
        }
        fn take_interrupts(&mut self) -> Result<crate::nic::InterruptSummary> {
            Ok(Default::default())
        }
        fn poll_receive(&mut self) -> Result<Option<RxFrame>> {
            Ok(None)
        }
        fn set_receive_filters(&mut self, _: &crate::nic::ReceiveFilters) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn learns_from_replies_and_bounds_the_cache() {
        let mut cache = ArpCache::new();
        let mut nic = NoopNic;
        let station = LinkStation {
            ip: Ipv4Addr::new(192, 168, 1, 2),
            mac: nic.mac(),
        };

        for i in 0..(MAX_ARP_ENTRIES as u8 + 2) {
            let ip = Ipv4Addr::new(192, 168, 1, 100 + i);
            let mac = MacAddress::new([0x0a, 0, 0, 0, 0, i]);
            cache
                .handle_frame(&mut nic, station, &reply_frame(ip, mac))
                .unwrap();
        }

        assert_eq!(cache.entries.len(), MAX_ARP_ENTRIES);
        // Oldest two were evicted.
        assert!(cache.lookup(Ipv4Addr::new(192, 168, 1, 100)).is_none());
        assert!(cache.lookup(Ipv4Addr::new(192, 168, 1, 109)).is_some());
    }

    #[test]
    fn runt_and_foreign_frames_are_ignored() {
        let mut cache = ArpCache::new();
        let mut nic = NoopNic;
        let station = LinkStation {
            ip: Ipv4Addr::new(192, 168, 1, 2),
            mac: nic.mac(),
        };

        let runt = RxFrame {
            dest: station.mac,
            src: MacAddress::new([1; 6]),
            ethertype: ETHERTYPE_ARP,
            payload: Bytes::from_static(&[0, 1, 8, 0]),
        };
        cache.handle_frame(&mut nic, station, &runt).unwrap();
        assert!(cache.entries.is_empty());
    }
}
