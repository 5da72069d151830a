//! Raw-frame NIC backed by a pnet datalink channel.

use bytes::Bytes;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherType, EthernetPacket, MutableEthernetPacket};
use pnet::util::MacAddr;
use std::io;
use std::time::Duration;
use tracing::debug;

use kestrel_core::MacAddress;
use kestrel_net::{
    InterruptSummary, NetError, Nic, ReceiveFilters, Result, RxFrame, TxDisposition,
};

const ETHERNET_HEADER_LEN: usize = 14;
const MAX_FRAME_LEN: usize = 1514;
/// Kernel read granularity. `poll_receive` must not park, so the channel
/// is opened with a short read timeout and a timed-out read maps to
/// "nothing yet".
const READ_TIMEOUT: Duration = Duration::from_millis(1);

pub struct DatalinkNic {
    mac: MacAddress,
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
    filters: ReceiveFilters,
    interrupts: InterruptSummary,
}

impl DatalinkNic {
    pub fn open(name: &str) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| NetError::Device(format!("no such interface: {name}")))?;
        let mac = interface
            .mac
            .ok_or_else(|| NetError::Device(format!("interface {name} has no MAC address")))?;

        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..datalink::Config::default()
        };
        let (tx, rx) = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(NetError::Device(format!(
                    "interface {name} is not an ethernet channel"
                )));
            }
            Err(e) => return Err(NetError::Device(e.to_string())),
        };

        debug!(interface = name, %mac, "datalink channel open");
        Ok(Self {
            mac: MacAddress::new(mac.octets()),
            tx,
            rx,
            // Accept unicast and broadcast until the stack installs a
            // filter policy.
            filters: ReceiveFilters {
                unicast: true,
                broadcast: true,
                ..ReceiveFilters::default()
            },
            interrupts: InterruptSummary::default(),
        })
    }

    /// Software stand-in for hardware receive filtering: the kernel hands
    /// us everything the interface saw.
    fn accepts(&self, dest: MacAddress) -> bool {
        if self.filters.promiscuous {
            return true;
        }
        if dest == self.mac {
            return self.filters.unicast;
        }
        if dest.is_broadcast() {
            return self.filters.broadcast;
        }
        if dest.as_bytes()[0] & 1 == 1 {
            return self.filters.promiscuous_multicast || self.filters.multicast.contains(&dest);
        }
        false
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn to_pnet(mac: MacAddress) -> MacAddr {
    let b = mac.as_bytes();
    MacAddr::new(b[0], b[1], b[2], b[3], b[4], b[5])
}

impl Nic for DatalinkNic {
    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn max_frame_len(&self) -> usize {
        MAX_FRAME_LEN
    }

    fn transmit(
        &mut self,
        dest: MacAddress,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<TxDisposition> {
        let mut buf = vec![0u8; ETHERNET_HEADER_LEN + payload.len()];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf)
                .ok_or(NetError::InvalidInput("frame buffer too small"))?;
            eth.set_destination(to_pnet(dest));
            eth.set_source(to_pnet(self.mac));
            eth.set_ethertype(EtherType::new(ethertype));
            eth.set_payload(payload);
        }
        match self.tx.send_to(&buf, None) {
            Some(Ok(())) => {
                self.interrupts.transmit = true;
                Ok(TxDisposition::Queued)
            }
            Some(Err(e)) if would_block(&e) => Ok(TxDisposition::Busy),
            Some(Err(e)) => Err(NetError::Device(e.to_string())),
            None => Err(NetError::Device("send channel closed".to_string())),
        }
    }

    fn reclaim_transmit(&mut self) -> Result<bool> {
        // The kernel owns the transmit ring; a frame accepted by send_to
        // is already out of our hands.
        Ok(true)
    }

    fn take_interrupts(&mut self) -> Result<InterruptSummary> {
        Ok(std::mem::take(&mut self.interrupts))
    }

    fn poll_receive(&mut self) -> Result<Option<RxFrame>> {
        let (dest, src, ethertype, payload) = {
            let bytes = match self.rx.next() {
                Ok(bytes) => bytes,
                Err(e) if would_block(&e) => return Ok(None),
                Err(e) => return Err(NetError::Device(e.to_string())),
            };
            let Some(eth) = EthernetPacket::new(bytes) else {
                return Ok(None);
            };
            (
                MacAddress::new(eth.get_destination().octets()),
                MacAddress::new(eth.get_source().octets()),
                eth.get_ethertype().0,
                Bytes::copy_from_slice(eth.payload()),
            )
        };
        if !self.accepts(dest) {
            return Ok(None);
        }
        self.interrupts.receive = true;
        Ok(Some(RxFrame {
            dest,
            src,
            ethertype,
            payload,
        }))
    }

    fn set_receive_filters(&mut self, filters: &ReceiveFilters) -> Result<()> {
        debug!(
            unicast = filters.unicast,
            broadcast = filters.broadcast,
            promiscuous = filters.promiscuous,
            groups = filters.multicast.len(),
            "receive filters updated"
        );
        self.filters = filters.clone();
        Ok(())
    }
}
