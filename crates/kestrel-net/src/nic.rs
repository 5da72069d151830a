//! Raw-frame NIC abstraction and the polling frame pump.
//!
//! The engine never blocks in the kernel: all waiting is a bounded poll
//! loop over [`Nic::poll_receive`], with the caller's progress callback
//! invoked on a fixed cadence so a firmware-style caller can abort.

use bytes::Bytes;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use kestrel_core::{ETHERTYPE_ARP, MacAddress};

use crate::arp::ArpService;
use crate::error::{NetError, Result};
use crate::igmp::IgmpService;

/// Progress callback invoked from inside polling loops. `Break` aborts the
/// surrounding operation with [`NetError::Aborted`].
pub type ProgressFn = dyn FnMut() -> ControlFlow<()>;

/// One inbound frame, media header already stripped by the NIC.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub dest: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: Bytes,
}

/// Outcome of handing a frame to the NIC transmit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDisposition {
    Queued,
    Busy,
}

/// Interrupt causes accumulated since the last query.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptSummary {
    pub transmit: bool,
    pub receive: bool,
}

/// Link-layer receive filter configuration.
#[derive(Debug, Clone, Default)]
pub struct ReceiveFilters {
    pub unicast: bool,
    pub broadcast: bool,
    pub promiscuous: bool,
    pub promiscuous_multicast: bool,
    /// Multicast MAC addresses to accept when not promiscuous.
    pub multicast: Vec<MacAddress>,
}

/// Raw frame interface. Implementations must be non-blocking: both
/// `transmit` and `poll_receive` return immediately.
pub trait Nic {
    fn mac(&self) -> MacAddress;

    /// Bytes of media header the NIC prepends to `transmit` payloads.
    fn media_header_len(&self) -> usize {
        14
    }

    /// Largest frame (media header included) the link accepts.
    fn max_frame_len(&self) -> usize;

    /// Enqueue one frame. `Busy` means the transmit queue had no room;
    /// the caller retries after reclaiming.
    fn transmit(&mut self, dest: MacAddress, ethertype: u16, payload: &[u8])
    -> Result<TxDisposition>;

    /// Recycle completed transmit buffers. Returns true once the most
    /// recently queued frame has left the device.
    fn reclaim_transmit(&mut self) -> Result<bool>;

    /// Read and clear accumulated interrupt causes.
    fn take_interrupts(&mut self) -> Result<InterruptSummary>;

    /// Non-blocking receive poll.
    fn poll_receive(&mut self) -> Result<Option<RxFrame>>;

    fn set_receive_filters(&mut self, filters: &ReceiveFilters) -> Result<()>;
}

/// Station identity threaded through the pump so the ARP and IGMP
/// collaborators can build replies.
#[derive(Debug, Clone, Copy)]
pub struct LinkStation {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

/// How long to wait for the transmit queue to accept a frame.
const TX_QUEUE_WAIT: Duration = Duration::from_millis(5);
/// How long to wait for transmit buffer reclamation after queueing.
const TX_RECLAIM_WAIT: Duration = Duration::from_millis(5);
/// Cadence of the caller progress callback inside receive polling.
const PROGRESS_TICK: Duration = Duration::from_millis(100);
/// Idle backoff between empty polls.
const POLL_IDLE: Duration = Duration::from_micros(100);

/// Blocking-with-timeout send/receive over a [`Nic`].
#[derive(Debug, Default)]
pub struct FramePump {
    /// Whether the last send observed a transmit interrupt.
    tx_interrupt_seen: bool,
}

impl FramePump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tx_interrupt_seen(&self) -> bool {
        self.tx_interrupt_seen
    }

    /// Send one frame: clear stale interrupt state, run the about-to-send
    /// callback, bounded-wait for queue acceptance, then bounded-wait for
    /// buffer reclamation.
    pub fn send(
        &mut self,
        nic: &mut dyn Nic,
        dest: MacAddress,
        ethertype: u16,
        frame: &[u8],
        mut before_send: Option<&mut ProgressFn>,
    ) -> Result<()> {
        // Stale causes from earlier traffic must not be mistaken for this
        // frame's completion.
        let _ = nic.take_interrupts()?;

        if let Some(cb) = before_send.as_mut()
            && cb().is_break()
        {
            return Err(NetError::Aborted);
        }

        let queue_deadline = Instant::now() + TX_QUEUE_WAIT;
        loop {
            match nic.transmit(dest, ethertype, frame)? {
                TxDisposition::Queued => break,
                TxDisposition::Busy => {
                    let _ = nic.reclaim_transmit()?;
                    if Instant::now() >= queue_deadline {
                        debug!(%dest, ethertype, "transmit queue stayed full");
                        return Err(NetError::Timeout);
                    }
                }
            }
        }

        self.tx_interrupt_seen = false;
        let reclaim_deadline = Instant::now() + TX_RECLAIM_WAIT;
        loop {
            if nic.take_interrupts()?.transmit {
                self.tx_interrupt_seen = true;
            }
            if nic.reclaim_transmit()? {
                return Ok(());
            }
            if Instant::now() >= reclaim_deadline {
                // The frame was queued; a slow reclaim is not a failure.
                trace!("transmit buffer not reclaimed within bound");
                return Ok(());
            }
        }
    }

    /// Poll for one frame. ARP frames are handed to the ARP collaborator
    /// and polling continues; IGMP timers are serviced each iteration.
    ///
    /// With no `timeout` and no progress callback there is no way for the
    /// caller to ever regain control, so that combination fails with
    /// `Timeout` immediately.
    pub fn receive(
        &mut self,
        nic: &mut dyn Nic,
        arp: &mut dyn ArpService,
        igmp: &mut dyn IgmpService,
        station: LinkStation,
        timeout: Option<Duration>,
        mut progress: Option<&mut ProgressFn>,
    ) -> Result<RxFrame> {
        if timeout.is_none() && progress.is_none() {
            return Err(NetError::Timeout);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut next_tick = Instant::now() + PROGRESS_TICK;

        loop {
            igmp.check_timers(nic, station)?;

            if let Some(frame) = nic.poll_receive()? {
                if frame.ethertype == ETHERTYPE_ARP {
                    arp.handle_frame(nic, station, &frame)?;
                    continue;
                }
                return Ok(frame);
            }

            let now = Instant::now();
            if let Some(cb) = progress.as_mut()
                && now >= next_tick
            {
                next_tick = now + PROGRESS_TICK;
                if cb().is_break() {
                    return Err(NetError::Aborted);
                }
            }
            if let Some(d) = deadline
                && now >= d
            {
                return Err(NetError::Timeout);
            }

            std::thread::sleep(POLL_IDLE);
        }
    }
}
