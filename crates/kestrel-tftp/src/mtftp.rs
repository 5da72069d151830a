//! Multicast TFTP: dual-path open and passive windowed listen.
//!
//! MTFTP shares one server transmission among many clients: the client
//! joins a multicast group and passively collects DATA packets, ACKing
//! nothing. A client that saw nothing (or needs re-acquisition) sends an
//! RRQ and drains over the normal lock-step path; the server replies on
//! both the unicast and multicast addresses so late joiners can latch on.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use kestrel_net::{IpFilter, UdpRead, UdpWrite};

use crate::error::{Result, TftpError};
use crate::packet::{self, Opcode, Packet};
use crate::session::{SessionState, Sink, TftpSession};

/// Addressing and patience parameters for one multicast transfer,
/// normally handed out by the boot server.
#[derive(Debug, Clone, Copy)]
pub struct MtftpInfo {
    pub group: Ipv4Addr,
    /// Port the client listens on (and sends the RRQ from).
    pub client_port: u16,
    /// Port the server listens on for MTFTP requests.
    pub server_port: u16,
    /// How long one passive listen window lasts.
    pub listen_timeout: Duration,
    /// How long to wait for a reply after sending the RRQ.
    pub transmit_timeout: Duration,
}

/// Which reply paths `open` has observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenStatus {
    pub got_unicast: bool,
    pub got_multicast: bool,
}

impl OpenStatus {
    fn complete(&self) -> bool {
        self.got_unicast && self.got_multicast
    }
}

/// Result of one passive listen window.
#[derive(Debug, Clone, Copy)]
pub struct ListenOutcome {
    /// Blocks skipped over within this window.
    pub missed: u64,
    /// A short packet or the final block ended the transfer.
    pub finished: bool,
}

pub struct MtftpSession {
    tftp: TftpSession,
    info: MtftpInfo,
}

impl MtftpSession {
    pub fn new(tftp: TftpSession, info: MtftpInfo) -> Self {
        Self { tftp, info }
    }

    pub fn into_inner(self) -> TftpSession {
        self.tftp
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.tftp.bytes_transferred()
    }

    /// Download `filename` into `sink`, preferring the multicast path
    /// and degrading to dual-path open and finally plain unicast TFTP.
    pub fn download(&mut self, filename: &str, sink: &mut Sink) -> Result<u64> {
        self.tftp.begin()?;
        self.prepare();
        let result = self.run_download(filename, sink);
        let _ = self.leave_group();
        self.tftp.finish(result)
    }

    /// Issue the RRQ on the MTFTP port pair and classify replies by
    /// destination until both the unicast and the multicast path have
    /// been seen (or the window times out with a partial status), then
    /// drain the remainder in lock step.
    pub fn open(&mut self, filename: &str, sink: &mut Sink) -> Result<(OpenStatus, u64)> {
        self.tftp.begin()?;
        self.prepare();
        let result = self.run_open(filename, sink);
        let _ = self.leave_group();
        self.tftp.state = match result {
            Ok(_) => SessionState::Done,
            Err(_) => SessionState::Failed,
        };
        result
    }

    /// Passively receive multicast DATA without acknowledging anything.
    ///
    /// `start_block` carries the last consumed block in and the last
    /// received block out; gaps are tallied into the outcome, and the
    /// payload of each block lands at its true byte offset so the gap
    /// can be backfilled later.
    pub fn listen(
        &mut self,
        sink: &mut Sink,
        start_block: &mut u64,
        final_block: Option<u64>,
        listen_timeout: Duration,
    ) -> Result<ListenOutcome> {
        if self.tftp.state == SessionState::Idle {
            self.tftp.begin()?;
            self.prepare();
        }
        self.join_group()?;

        let bs = self.tftp.block_size;
        let mut buf = vec![0u8; bs + 64];
        let mut missed = 0u64;
        let deadline = Instant::now() + listen_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ListenOutcome { missed, finished: false });
            }
            let read = UdpRead {
                src_ip: Some(self.tftp.server_ip),
                src_port: None,
                dest_ip: Some(self.info.group),
                dest_port: Some(self.info.client_port),
            };
            let info = match self.tftp.stack.udp_read(&read, &mut buf, Some(deadline - now)) {
                Ok(info) => info,
                Err(kestrel_net::NetError::Timeout) => {
                    return Ok(ListenOutcome { missed, finished: false });
                }
                Err(err) => return Err(err.into()),
            };

            let (block, data) = match packet::parse(&buf[..info.len]) {
                Ok(Packet::Data { block, big: false, data }) => (block, data),
                Ok(Packet::Error { code, message }) => {
                    return Err(TftpError::Server { code, message });
                }
                Ok(_) => {
                    return Err(TftpError::Protocol(
                        "unexpected packet on multicast group".to_string(),
                    ));
                }
                Err(err) => {
                    warn!(%err, "dropping malformed multicast packet");
                    continue;
                }
            };

            if block == *start_block {
                continue; // retransmission of what we already have
            }
            if block < *start_block {
                return Err(TftpError::Protocol(format!(
                    "multicast block number went backwards: {} after {}",
                    block, *start_block
                )));
            }

            missed += block - *start_block - 1;
            let offset = (block - 1) * bs as u64;
            sink.write_at(offset, &data);
            *start_block = block;
            self.tftp.bytes_transferred =
                self.tftp.bytes_transferred.max(offset + data.len() as u64);
            debug!(block, len = data.len(), missed, "multicast DATA");

            if data.len() < bs || final_block == Some(block) {
                return Ok(ListenOutcome { missed, finished: true });
            }
        }
    }

    fn run_download(&mut self, filename: &str, sink: &mut Sink) -> Result<u64> {
        let base_secs = self.info.listen_timeout.as_secs().max(1);
        let mut start_block = 0u64;
        let mut missed = 0u64;

        loop {
            let window_secs = base_secs.saturating_sub(missed);
            if window_secs == 0 {
                // Patience exhausted; finish over the request path.
                let (_, bytes) = self.run_open(filename, sink)?;
                return Ok(bytes);
            }

            let before = start_block;
            let outcome = self.listen(
                sink,
                &mut start_block,
                None,
                Duration::from_secs(window_secs),
            )?;
            missed += outcome.missed;

            if outcome.finished {
                if missed == 0 {
                    return Ok(self.tftp.bytes_transferred);
                }
                // Holes remain behind the short packet; re-fetch the
                // whole file over unicast rather than serve a torn image.
                warn!(missed, "multicast transfer left gaps, re-fetching over unicast");
                return self.unicast_fallback(filename, sink);
            }

            if start_block == before {
                if start_block == 0 {
                    // Multicast never produced a byte: dual-path open,
                    // then plain TFTP as the last resort.
                    match self.run_open(filename, sink) {
                        Ok((_, bytes)) => return Ok(bytes),
                        Err(TftpError::Timeout) => {
                            warn!("MTFTP produced no data, falling back to unicast TFTP");
                            return self.unicast_fallback(filename, sink);
                        }
                        Err(err) => return Err(err),
                    }
                }
                // Mid-transfer stall: re-acquire through the ACK-driven
                // path from where the window left off.
                let (_, bytes) = self.run_open(filename, sink)?;
                return Ok(bytes);
            }
        }
    }

    fn run_open(&mut self, filename: &str, sink: &mut Sink) -> Result<(OpenStatus, u64)> {
        self.join_group()?;
        let request = packet::build_request(Opcode::Rrq, filename, &[]);
        let bs = self.tftp.block_size;
        let mut buf = vec![0u8; bs + 64];
        let mut status = OpenStatus::default();
        let mut first: Option<(u64, bytes::Bytes)> = None;

        'attempts: for attempt in 0..self.tftp.opts.retries.max(1) {
            if attempt > 0 {
                debug!(attempt, "re-sending MTFTP request");
            }
            let write = UdpWrite {
                dest_ip: self.tftp.server_ip,
                dest_port: self.info.server_port,
                src_ip: None,
                src_port: Some(self.info.client_port),
                gateway: None,
            };
            self.tftp.stack.udp_write(&write, &request)?;

            let deadline = Instant::now() + self.info.transmit_timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    if first.is_some() {
                        break 'attempts; // partial status is good enough
                    }
                    continue 'attempts;
                }
                let read = UdpRead {
                    src_ip: Some(self.tftp.server_ip),
                    src_port: None,
                    dest_ip: None,
                    dest_port: Some(self.info.client_port),
                };
                let info = match self.tftp.stack.udp_read(&read, &mut buf, Some(deadline - now))
                {
                    Ok(info) => info,
                    Err(kestrel_net::NetError::Timeout) => continue,
                    Err(err) => return Err(err.into()),
                };

                match packet::parse(&buf[..info.len]) {
                    Ok(Packet::Data { block: 0, .. }) => {
                        // Blocks are numbered from 1; zero would corrupt
                        // the offset math below.
                        return Err(TftpError::Protocol(
                            "DATA with block number zero".to_string(),
                        ));
                    }
                    Ok(Packet::Data { block, big: false, data }) => {
                        if info.dest_ip == self.info.group {
                            status.got_multicast = true;
                        } else {
                            status.got_unicast = true;
                        }
                        if first.is_none() {
                            self.tftp.server_tid = Some(info.src_port);
                            first = Some((block, data));
                        }
                        if status.complete() {
                            break 'attempts;
                        }
                    }
                    Ok(Packet::Error { code, message }) => {
                        return Err(TftpError::Server { code, message });
                    }
                    Ok(_) => {
                        return Err(TftpError::Protocol(
                            "unexpected reply to MTFTP request".to_string(),
                        ));
                    }
                    Err(err) => {
                        warn!(%err, "dropping malformed MTFTP reply");
                    }
                }
            }
        }

        let (block, data) = first.ok_or(TftpError::Timeout)?;
        info!(?status, block, "MTFTP open acquired the stream");
        self.tftp.state = SessionState::Transferring;

        let offset = (block - 1) * bs as u64;
        sink.write_at(offset, &data);
        self.tftp.bytes_transferred = self.tftp.bytes_transferred.max(offset + data.len() as u64);
        if data.len() < bs {
            self.tftp.send_ack(block)?;
            return Ok((status, self.tftp.bytes_transferred));
        }

        let bytes = self.tftp.lock_step_receive(None, block, sink)?;
        Ok((status, bytes))
    }

    /// Re-fetch the whole file with a plain unicast TFTP transfer on a
    /// fresh ephemeral port.
    fn unicast_fallback(&mut self, filename: &str, sink: &mut Sink) -> Result<u64> {
        let _ = self.leave_group();
        self.tftp.reset();
        self.tftp.download(filename, sink)
    }

    /// Set `tftp` session fields the MTFTP paths rely on: the pinned
    /// client port, the configured block size (MTFTP does not
    /// negotiate), and 16-bit block numbers.
    fn prepare(&mut self) {
        self.tftp.client_port = self.info.client_port;
        self.tftp.block_size = self.tftp.opts.block_size;
        self.tftp.big_blocks = false;
        self.tftp.server_tid = None;
    }

    fn join_group(&mut self) -> Result<()> {
        let current = self.tftp.stack.filter();
        if current.groups.contains(&self.info.group) {
            return Ok(());
        }
        let filter = IpFilter {
            groups: vec![self.info.group],
            ..IpFilter::default()
        };
        self.tftp.stack.set_filter(filter)?;
        Ok(())
    }

    fn leave_group(&mut self) -> Result<()> {
        if self.tftp.stack.filter().groups.is_empty() {
            return Ok(());
        }
        self.tftp.stack.set_filter(IpFilter::default())?;
        Ok(())
    }
}
