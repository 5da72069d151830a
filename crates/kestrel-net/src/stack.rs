//! The per-session network context.
//!
//! Everything the original firmware kept in globals (route table, random
//! seed, filter set, scratch buffers) lives here as owned fields; callers
//! thread `&mut Stack` through every operation and must serialize access.

use bytes::BytesMut;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::debug;

use kestrel_core::{MAX_DATAGRAM_SIZE, MacAddress};

use crate::arp::ArpService;
use crate::error::Result;
use crate::igmp::IgmpService;
use crate::ipv4::{IpFilter, MAX_MULTICAST_GROUPS, RouteTable};
use crate::nic::{FramePump, LinkStation, Nic, ReceiveFilters};

/// Lowest ephemeral source port the rolling allocator hands out.
const EPHEMERAL_PORT_BASE: u16 = 2070;
const EPHEMERAL_PORT_LIMIT: u16 = 32767;

/// Station configuration, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    pub station_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Default gateway for off-link destinations.
    pub gateway: Option<Ipv4Addr>,
    pub ttl: u8,
    pub tos: u8,
    /// When false, only cached ARP entries are used and uncached next
    /// hops fail with `NoRoute`.
    pub auto_arp: bool,
    pub arp_timeout: Duration,
}

impl StackConfig {
    pub fn new(station_ip: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Self {
            station_ip,
            subnet_mask,
            gateway: None,
            ttl: 16,
            tos: 0,
            auto_arp: true,
            arp_timeout: Duration::from_secs(1),
        }
    }
}

/// One session's network state: NIC + collaborators, station config,
/// route table, destination filter, rolling identifiers, scratch buffer.
pub struct Stack {
    pub(crate) nic: Box<dyn Nic>,
    pub(crate) arp: Box<dyn ArpService>,
    pub(crate) igmp: Box<dyn IgmpService>,
    pub(crate) cfg: StackConfig,
    pub(crate) filter: IpFilter,
    pub(crate) routes: RouteTable,
    pub(crate) pump: FramePump,
    pub(crate) ident: u16,
    pub(crate) port_counter: u16,
    pub(crate) tx_buf: BytesMut,
    pub(crate) progress: Option<Box<dyn FnMut() -> ControlFlow<()>>>,
}

impl Stack {
    pub fn new(
        nic: Box<dyn Nic>,
        arp: Box<dyn ArpService>,
        igmp: Box<dyn IgmpService>,
        cfg: StackConfig,
    ) -> Self {
        let mut rng = SmallRng::from_entropy();
        let span = EPHEMERAL_PORT_LIMIT - EPHEMERAL_PORT_BASE;
        Self {
            nic,
            arp,
            igmp,
            cfg,
            filter: IpFilter::default(),
            routes: RouteTable::default(),
            pump: FramePump::new(),
            ident: rng.r#gen(),
            port_counter: EPHEMERAL_PORT_BASE + rng.gen_range(0..span),
            tx_buf: BytesMut::with_capacity(MAX_DATAGRAM_SIZE),
            progress: None,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn station(&self) -> LinkStation {
        LinkStation {
            ip: self.cfg.station_ip,
            mac: self.nic.mac(),
        }
    }

    /// Install the periodic progress callback invoked from polling loops.
    /// Returning `ControlFlow::Break` aborts the surrounding operation.
    pub fn set_progress(&mut self, callback: Option<Box<dyn FnMut() -> ControlFlow<()>>>) {
        self.progress = callback;
    }

    /// Replace the destination filter policy, reconciling link-layer
    /// receive filters and IGMP memberships with the new group list.
    pub fn set_filter(&mut self, filter: IpFilter) -> Result<()> {
        let mut filter = filter;
        filter.groups.truncate(MAX_MULTICAST_GROUPS);
        let station = self.station();

        for old in self.filter.groups.clone() {
            if !filter.groups.contains(&old) {
                self.igmp.leave(self.nic.as_mut(), station, old)?;
            }
        }
        for new in &filter.groups {
            if !self.filter.groups.contains(new) {
                self.igmp.join(self.nic.as_mut(), station, *new)?;
            }
        }

        let link = ReceiveFilters {
            unicast: filter.station,
            broadcast: filter.broadcast,
            promiscuous: filter.promiscuous,
            promiscuous_multicast: filter.promiscuous_multicast,
            multicast: filter
                .groups
                .iter()
                .map(|g| MacAddress::for_multicast(*g))
                .collect(),
        };
        self.nic.set_receive_filters(&link)?;

        debug!(?filter, "destination filter updated");
        self.filter = filter;
        Ok(())
    }

    pub fn filter(&self) -> &IpFilter {
        &self.filter
    }

    /// Rolling IP identification, randomly seeded at session start.
    pub(crate) fn next_ident(&mut self) -> u16 {
        self.ident = self.ident.wrapping_add(1);
        self.ident
    }

    /// Rolling ephemeral port allocator.
    pub fn next_ephemeral_port(&mut self) -> u16 {
        let port = self.port_counter;
        self.port_counter = if self.port_counter >= EPHEMERAL_PORT_LIMIT {
            EPHEMERAL_PORT_BASE
        } else {
            self.port_counter + 1
        };
        port
    }

    /// Whether the last frame send observed a transmit interrupt.
    pub fn tx_interrupt_seen(&self) -> bool {
        self.pump.tx_interrupt_seen()
    }
}
