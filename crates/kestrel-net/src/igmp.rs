//! IGMP collaborator: multicast group membership maintenance.
//!
//! The IPv4 engine joins and leaves groups through [`IgmpService`] and
//! forwards inbound protocol-2 datagrams to it; [`IgmpMembership`] is a
//! small IGMPv2 reporter (unsolicited reports on join, query-driven
//! reports from the timer hook, leave on departure).

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use kestrel_core::{ETHERTYPE_IPV4, MacAddress};

use crate::checksum::checksum16;
use crate::error::{NetError, Result};
use crate::ipv4::{IPV4_HEADER_LEN, Ipv4Header, PROTO_IGMP};
use crate::nic::{LinkStation, Nic, TxDisposition};

const TYPE_MEMBERSHIP_QUERY: u8 = 0x11;
const TYPE_V2_REPORT: u8 = 0x16;
const TYPE_V2_LEAVE: u8 = 0x17;

/// All-routers group, destination of leave messages.
const ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);

const IGMP_MESSAGE_LEN: usize = 8;
/// Unsolicited report repeats after a join.
const UNSOLICITED_REPORTS: u8 = 2;
const UNSOLICITED_INTERVAL: Duration = Duration::from_secs(1);

/// Multicast membership maintenance as consumed by the IPv4 layer.
pub trait IgmpService {
    fn join(&mut self, nic: &mut dyn Nic, station: LinkStation, group: Ipv4Addr) -> Result<()>;

    fn leave(&mut self, nic: &mut dyn Nic, station: LinkStation, group: Ipv4Addr) -> Result<()>;

    /// Invoked once per poll iteration from the frame pump.
    fn check_timers(&mut self, nic: &mut dyn Nic, station: LinkStation) -> Result<()>;

    /// Inbound IGMP datagram (IP payload, header already stripped).
    fn handle_packet(&mut self, packet: &[u8]);
}

#[derive(Debug)]
struct GroupState {
    group: Ipv4Addr,
    report_due: Option<Instant>,
    unsolicited_left: u8,
}

/// IGMPv2 group membership reporter.
#[derive(Debug, Default)]
pub struct IgmpMembership {
    groups: Vec<GroupState>,
    ident: u16,
}

impl IgmpMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        self.groups.iter().any(|g| g.group == group)
    }

    fn send_message(
        &mut self,
        nic: &mut dyn Nic,
        station: LinkStation,
        msg_type: u8,
        group: Ipv4Addr,
        dest: Ipv4Addr,
    ) -> Result<()> {
        let mut igmp = BytesMut::with_capacity(IGMP_MESSAGE_LEN);
        igmp.put_u8(msg_type);
        igmp.put_u8(0);
        igmp.put_u16(0); // checksum placeholder
        igmp.put_slice(&group.octets());
        let cksum = checksum16(&igmp);
        igmp[2..4].copy_from_slice(&cksum.to_be_bytes());

        self.ident = self.ident.wrapping_add(1);
        let header = Ipv4Header {
            src: station.ip,
            dest,
            protocol: PROTO_IGMP,
            ttl: 1, // membership messages never cross a router
            tos: 0,
            ident: self.ident,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            total_len: (IPV4_HEADER_LEN + IGMP_MESSAGE_LEN) as u16,
        };

        let mut frame = BytesMut::with_capacity(IPV4_HEADER_LEN + IGMP_MESSAGE_LEN);
        header.encode_into(&mut frame);
        frame.put_slice(&igmp);

        match nic.transmit(MacAddress::for_multicast(dest), ETHERTYPE_IPV4, &frame)? {
            TxDisposition::Queued => Ok(()),
            TxDisposition::Busy => Err(NetError::Device("transmit queue full".into())),
        }
    }
}

impl IgmpService for IgmpMembership {
    fn join(&mut self, nic: &mut dyn Nic, station: LinkStation, group: Ipv4Addr) -> Result<()> {
        if !group.is_multicast() {
            return Err(NetError::InvalidInput("join target is not multicast"));
        }
        if self.is_member(group) {
            return Ok(());
        }
        debug!(%group, "joining multicast group");
        self.send_message(nic, station, TYPE_V2_REPORT, group, group)?;
        self.groups.push(GroupState {
            group,
            report_due: Some(Instant::now() + UNSOLICITED_INTERVAL),
            unsolicited_left: UNSOLICITED_REPORTS - 1,
        });
        Ok(())
    }

    fn leave(&mut self, nic: &mut dyn Nic, station: LinkStation, group: Ipv4Addr) -> Result<()> {
        let Some(pos) = self.groups.iter().position(|g| g.group == group) else {
            return Ok(());
        };
        self.groups.remove(pos);
        debug!(%group, "leaving multicast group");
        self.send_message(nic, station, TYPE_V2_LEAVE, group, ALL_ROUTERS)
    }

    fn check_timers(&mut self, nic: &mut dyn Nic, station: LinkStation) -> Result<()> {
        let now = Instant::now();
        let due: Vec<Ipv4Addr> = self
            .groups
            .iter()
            .filter(|g| g.report_due.is_some_and(|t| t <= now))
            .map(|g| g.group)
            .collect();

        for group in due {
            self.send_message(nic, station, TYPE_V2_REPORT, group, group)?;
            if let Some(state) = self.groups.iter_mut().find(|g| g.group == group) {
                if state.unsolicited_left > 0 {
                    state.unsolicited_left -= 1;
                    state.report_due = Some(now + UNSOLICITED_INTERVAL);
                } else {
                    state.report_due = None;
                }
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        if packet.len() < IGMP_MESSAGE_LEN || checksum16(&packet[..IGMP_MESSAGE_LEN]) != 0 {
            return;
        }
        if packet[0] != TYPE_MEMBERSHIP_QUERY {
            return;
        }

        // Max response time is in tenths of a second; zero means an IGMPv1
        // querier, which expects a response within 10 seconds.
        let max_resp = match packet[1] {
            0 => Duration::from_secs(10),
            t => Duration::from_millis(t as u64 * 100),
        };
        let queried = Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7]);
        let respond_at = Instant::now() + max_resp / 2;

        for state in &mut self.groups {
            if queried.is_unspecified() || queried == state.group {
                trace!(group = %state.group, "membership query, scheduling report");
                let due = state.report_due.map_or(respond_at, |t| t.min(respond_at));
                state.report_due = Some(due);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_schedules_reports_for_joined_groups() {
        let mut igmp = IgmpMembership::new();
        igmp.groups.push(GroupState {
            group: Ipv4Addr::new(224, 0, 1, 1),
            report_due: None,
            unsolicited_left: 0,
        });

        // General query, 5 second max response time.
        let mut query = [TYPE_MEMBERSHIP_QUERY, 50, 0, 0, 0, 0, 0, 0];
        let cksum = checksum16(&query);
        query[2..4].copy_from_slice(&cksum.to_be_bytes());

        igmp.handle_packet(&query);
        assert!(igmp.groups[0].report_due.is_some());
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let mut igmp = IgmpMembership::new();
        igmp.groups.push(GroupState {
            group: Ipv4Addr::new(224, 0, 1, 1),
            report_due: None,
            unsolicited_left: 0,
        });

        let query = [TYPE_MEMBERSHIP_QUERY, 50, 0xde, 0xad, 0, 0, 0, 0];
        igmp.handle_packet(&query);
        assert!(igmp.groups[0].report_due.is_none());
    }
}
