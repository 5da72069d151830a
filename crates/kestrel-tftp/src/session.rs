//! Unicast TFTP session: request/negotiate, lock-step receive, upload,
//! size probe, directory read.
//!
//! One session drives one transfer at a time over an owned [`Stack`].
//! Every failure parks the session in `Failed`; call [`TftpSession::reset`]
//! before reuse.

use bytes::Bytes;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use kestrel_net::{Stack, UdpRead, UdpWrite};

use crate::error::{Result, TftpError};
use crate::packet::{
    self, DEFAULT_BLOCK_SIZE, ErrorCode, Opcode, Packet, TFTP_PORT, OPT_BIGBLK, OPT_BLKSIZE,
    OPT_OVERWRITE, OPT_TSIZE, BIGBLK_VALUE,
};

pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestSent,
    Transferring,
    Done,
    Failed,
}

/// Caller-tunable knobs for a transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Block size to request; the server may negotiate it down.
    pub block_size: usize,
    /// Request 64-bit block numbers.
    pub big_blocks: bool,
    /// Ask the server to allow overwriting on upload.
    pub overwrite: bool,
    /// How long to wait for each reply.
    pub timeout: std::time::Duration,
    /// Attempts per request or block before giving up.
    pub retries: u32,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            big_blocks: false,
            overwrite: false,
            timeout: std::time::Duration::from_secs(5),
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Last ERROR packet received from the peer, kept for inspection after
/// the failure surfaces.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: u16,
    pub message: String,
}

/// Destination for downloaded bytes. Blocks land at their byte offset,
/// so multicast windows can fill gaps out of order; `Discard` only
/// counts (used by size probes).
pub enum Sink<'a> {
    Buffer(&'a mut Vec<u8>),
    Discard,
}

impl Sink<'_> {
    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) {
        if let Sink::Buffer(buf) = self {
            let offset = offset as usize;
            if buf.len() < offset + data.len() {
                buf.resize(offset + data.len(), 0);
            }
            buf[offset..offset + data.len()].copy_from_slice(data);
        }
    }
}

/// A server reply to a request.
pub(crate) enum Reply {
    Oack,
    Data { block: u64, big: bool, data: Bytes },
    Ack { block: u64, big: bool },
}

pub struct TftpSession {
    pub(crate) stack: Stack,
    pub(crate) server_ip: Ipv4Addr,
    pub(crate) server_port: u16,
    pub(crate) opts: TransferOptions,
    pub(crate) state: SessionState,
    /// Effective block size for the current transfer.
    pub(crate) block_size: usize,
    pub(crate) big_blocks: bool,
    /// Cleared after the no-option fallback; stays cleared until reset.
    pub(crate) use_options: bool,
    pub(crate) client_port: u16,
    /// Server transfer ID, learned from the first reply.
    pub(crate) server_tid: Option<u16>,
    pub(crate) bytes_transferred: u64,
    pub(crate) last_error: Option<ServerError>,
    /// tsize from the most recent OACK, if the server echoed one.
    last_acked_tsize: Option<u64>,
}

impl TftpSession {
    pub fn new(stack: Stack, server_ip: Ipv4Addr, opts: TransferOptions) -> Self {
        Self {
            stack,
            server_ip,
            server_port: TFTP_PORT,
            opts,
            state: SessionState::Idle,
            block_size: opts.block_size,
            big_blocks: opts.big_blocks,
            use_options: true,
            client_port: 0,
            server_tid: None,
            bytes_transferred: 0,
            last_error: None,
            last_acked_tsize: None,
        }
    }

    /// Override the well-known request port.
    pub fn set_server_port(&mut self, port: u16) {
        self.server_port = port;
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn into_stack(self) -> Stack {
        self.stack
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_server_error(&self) -> Option<&ServerError> {
        self.last_error.as_ref()
    }

    /// Count of bytes moved by the current or last transfer, valid even
    /// after a failure.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Whether option negotiation is still in play (cleared by the
    /// plain-RFC-1350 fallback).
    pub fn options_enabled(&self) -> bool {
        self.use_options
    }

    /// Return the session to `Idle` so another transfer can start.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.use_options = true;
        self.block_size = self.opts.block_size;
        self.big_blocks = self.opts.big_blocks;
        self.server_tid = None;
        self.bytes_transferred = 0;
        self.last_error = None;
    }

    /// Download `filename` into `sink`; returns the byte count.
    pub fn download(&mut self, filename: &str, sink: &mut Sink) -> Result<u64> {
        self.begin()?;
        let result = self.run_download(Opcode::Rrq, filename, sink);
        self.finish(result)
    }

    /// Fetch a directory listing (private DIR opcode); same lock-step
    /// machinery as a read.
    pub fn read_directory(&mut self, filename: &str, sink: &mut Sink) -> Result<u64> {
        self.begin()?;
        let result = self.run_download(Opcode::Dir, filename, sink);
        self.finish(result)
    }

    /// Upload `data` as `filename`; returns the byte count.
    pub fn upload(&mut self, filename: &str, data: &[u8]) -> Result<u64> {
        self.begin()?;
        let result = self.run_upload(filename, data);
        self.finish(result)
    }

    /// Learn the size of `filename` without downloading it, via the
    /// tsize option when the server supports it, else by draining the
    /// file into a discard sink.
    pub fn query_size(&mut self, filename: &str) -> Result<u64> {
        self.begin()?;
        let result = self.run_query_size(filename);
        self.finish(result)
    }

    pub(crate) fn begin(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(TftpError::NotIdle);
        }
        self.block_size = if self.use_options {
            self.opts.block_size
        } else {
            DEFAULT_BLOCK_SIZE
        };
        self.big_blocks = self.opts.big_blocks && self.use_options;
        self.server_tid = None;
        self.bytes_transferred = 0;
        self.last_error = None;
        self.last_acked_tsize = None;
        self.client_port = self.stack.next_ephemeral_port();
        self.state = SessionState::RequestSent;
        Ok(())
    }

    pub(crate) fn finish(&mut self, result: Result<u64>) -> Result<u64> {
        self.state = match result {
            Ok(_) => SessionState::Done,
            Err(_) => SessionState::Failed,
        };
        result
    }

    fn run_download(&mut self, op: Opcode, filename: &str, sink: &mut Sink) -> Result<u64> {
        let options = self.request_options(op, None);
        let reply = self.request(op, filename, options)?;
        self.state = SessionState::Transferring;
        match reply {
            Reply::Oack => self.lock_step_receive(None, 0, sink),
            Reply::Data { block, big, data } => {
                if !big {
                    // Server skipped negotiation; RFC 1350 defaults apply.
                    self.big_blocks = false;
                    self.block_size = DEFAULT_BLOCK_SIZE;
                }
                self.lock_step_receive(Some((block, data)), 0, sink)
            }
            Reply::Ack { .. } => Err(TftpError::Protocol(
                "unexpected ACK in reply to read request".to_string(),
            )),
        }
    }

    fn run_upload(&mut self, filename: &str, data: &[u8]) -> Result<u64> {
        let options = self.request_options(Opcode::Wrq, Some(data.len() as u64));
        let reply = self.request(Opcode::Wrq, filename, options)?;
        self.state = SessionState::Transferring;
        match reply {
            Reply::Oack => {}
            Reply::Ack { block: 0, big: false } => {
                self.big_blocks = false;
                self.block_size = DEFAULT_BLOCK_SIZE;
            }
            Reply::Ack { block, .. } => {
                return Err(TftpError::Protocol(format!(
                    "write request acknowledged with block {}",
                    block
                )));
            }
            Reply::Data { .. } => {
                return Err(TftpError::Protocol(
                    "unexpected DATA in reply to write request".to_string(),
                ));
            }
        }

        let bs = self.block_size;
        let mut block = 0u64;
        loop {
            let offset = (block as usize) * bs;
            let end = (offset + bs).min(data.len());
            let chunk = &data[offset.min(data.len())..end];
            block += 1;
            self.transfer_block(block, chunk)?;
            self.bytes_transferred = end as u64;
            // A short (possibly empty) block terminates the transfer.
            if chunk.len() < bs {
                info!(blocks = block, bytes = self.bytes_transferred, "upload complete");
                return Ok(self.bytes_transferred);
            }
        }
    }

    fn run_query_size(&mut self, filename: &str) -> Result<u64> {
        let mut options = vec![(OPT_TSIZE.to_string(), "0".to_string())];
        if self.use_options && self.block_size != DEFAULT_BLOCK_SIZE {
            options.push((OPT_BLKSIZE.to_string(), self.block_size.to_string()));
        }
        let reply = self.request(Opcode::Rrq, filename, options)?;
        self.state = SessionState::Transferring;
        match reply {
            Reply::Oack => {
                if let Some(size) = self.last_acked_tsize.take() {
                    // The size is known; abort the pending transfer
                    // cleanly instead of downloading it.
                    let _ = self.send_to_server(&packet::build_error(
                        ErrorCode::NotDefined,
                        "size query only",
                    ));
                    debug!(size, "transfer size learned from OACK");
                    return Ok(size);
                }
                // OACK without tsize: drain to learn the length.
                self.lock_step_receive(None, 0, &mut Sink::Discard)
            }
            Reply::Data { block, big, data } => {
                if !big {
                    self.big_blocks = false;
                    self.block_size = DEFAULT_BLOCK_SIZE;
                }
                self.lock_step_receive(Some((block, data)), 0, &mut Sink::Discard)
            }
            Reply::Ack { .. } => Err(TftpError::Protocol(
                "unexpected ACK in reply to size query".to_string(),
            )),
        }
    }

    fn request_options(&self, op: Opcode, tsize: Option<u64>) -> Vec<(String, String)> {
        if !self.use_options {
            return Vec::new();
        }
        let mut options = Vec::new();
        if self.block_size != DEFAULT_BLOCK_SIZE {
            options.push((OPT_BLKSIZE.to_string(), self.block_size.to_string()));
        }
        if let Some(size) = tsize {
            options.push((OPT_TSIZE.to_string(), size.to_string()));
        }
        if self.opts.overwrite && op == Opcode::Wrq {
            options.push((OPT_OVERWRITE.to_string(), "1".to_string()));
        }
        if self.big_blocks {
            options.push((OPT_BIGBLK.to_string(), BIGBLK_VALUE.to_string()));
        }
        options
    }

    /// Send the request and read the first reply. If options were
    /// requested and the server answered with an ERROR, one explicit
    /// second phase runs with no options at all (plain RFC 1350).
    pub(crate) fn request(
        &mut self,
        op: Opcode,
        filename: &str,
        options: Vec<(String, String)>,
    ) -> Result<Reply> {
        match self.request_phase(op, filename, &options) {
            Err(TftpError::Server { code, .. }) if !options.is_empty() => {
                warn!(code, "server rejected option negotiation, retrying without options");
                self.use_options = false;
                self.big_blocks = false;
                self.block_size = DEFAULT_BLOCK_SIZE;
                self.server_tid = None;
                self.last_acked_tsize = None;
                self.request_phase(op, filename, &[])
            }
            other => other,
        }
    }

    fn request_phase(
        &mut self,
        op: Opcode,
        filename: &str,
        options: &[(String, String)],
    ) -> Result<Reply> {
        let request = packet::build_request(op, filename, options);
        for attempt in 0..self.opts.retries.max(1) {
            if attempt > 0 {
                debug!(attempt, "re-sending request");
            }
            let write = UdpWrite {
                dest_ip: self.server_ip,
                dest_port: self.server_port,
                src_ip: None,
                src_port: Some(self.client_port),
                gateway: None,
            };
            self.stack.udp_write(&write, &request)?;
            match self.read_reply() {
                Err(TftpError::Timeout) => continue,
                other => return other,
            }
        }
        Err(TftpError::Timeout)
    }

    /// Read and classify the next packet from the server. OACK options
    /// are applied to session state here; ERROR is captured and
    /// surfaced.
    pub(crate) fn read_reply(&mut self) -> Result<Reply> {
        let mut buf = vec![0u8; self.block_size.max(DEFAULT_BLOCK_SIZE) + 64];
        let read = UdpRead {
            src_ip: Some(self.server_ip),
            src_port: self.server_tid,
            dest_ip: None,
            dest_port: Some(self.client_port),
        };
        let info = self.stack.udp_read(&read, &mut buf, Some(self.opts.timeout))?;
        self.server_tid = Some(info.src_port);

        match packet::parse(&buf[..info.len])? {
            Packet::Oack(pairs) => {
                let acked = packet::parse_oack_options(&pairs, self.big_blocks)?;
                if let Some(size) = acked.block_size {
                    if size > self.block_size {
                        return Err(TftpError::Protocol(format!(
                            "server raised block size to {}",
                            size
                        )));
                    }
                    self.block_size = size;
                }
                self.big_blocks = acked.big_blocks;
                self.last_acked_tsize = acked.transfer_size;
                debug!(
                    block_size = self.block_size,
                    big_blocks = self.big_blocks,
                    "options acknowledged"
                );
                Ok(Reply::Oack)
            }
            Packet::Data { block, big, data } => {
                if big && !self.big_blocks {
                    return Err(TftpError::Protocol(
                        "unnegotiated 64-bit block number".to_string(),
                    ));
                }
                Ok(Reply::Data { block, big, data })
            }
            Packet::Ack { block, big } => Ok(Reply::Ack { block, big }),
            Packet::Error { code, message } => {
                self.last_error = Some(ServerError {
                    code,
                    message: message.clone(),
                });
                Err(TftpError::Server { code, message })
            }
        }
    }

    /// Drive the one-ACK-per-DATA loop until a short packet ends the
    /// transfer. `last_block` is the last block already consumed (0 when
    /// only an OACK has been seen); `first` is a DATA packet that
    /// arrived as the request reply.
    pub(crate) fn lock_step_receive(
        &mut self,
        mut first: Option<(u64, Bytes)>,
        mut last_block: u64,
        sink: &mut Sink,
    ) -> Result<u64> {
        loop {
            let (wire_block, data) = match first.take() {
                Some(d) => d,
                None => {
                    self.send_ack(last_block)?;
                    self.await_data(last_block)?
                }
            };

            if last_block > 0 && wire_block == self.wire_block(last_block) {
                debug!(block = wire_block, "duplicate DATA, re-acknowledging");
                continue;
            }
            let expected = self.wire_block(last_block + 1);
            if wire_block != expected {
                let message = format!("expected block {}, got {}", expected, wire_block);
                let _ = self.send_to_server(&packet::build_error(
                    ErrorCode::IllegalOperation,
                    "block number out of sequence",
                ));
                return Err(TftpError::Protocol(message));
            }

            last_block += 1;
            let offset = (last_block - 1) * self.block_size as u64;
            sink.write_at(offset, &data);
            self.bytes_transferred = offset + data.len() as u64;

            if data.len() < self.block_size {
                // Final courtesy ACK; the server does not reply to it.
                self.send_ack(last_block)?;
                info!(
                    blocks = last_block,
                    bytes = self.bytes_transferred,
                    "download complete"
                );
                return Ok(self.bytes_transferred);
            }
        }
    }

    /// Wait for the next DATA packet, re-acknowledging the last block on
    /// each timeout, up to the retry budget.
    fn await_data(&mut self, last_block: u64) -> Result<(u64, Bytes)> {
        for attempt in 0..self.opts.retries.max(1) {
            if attempt > 0 {
                warn!(attempt, block = last_block + 1, "DATA timeout, re-acknowledging");
                self.send_ack(last_block)?;
            }
            match self.read_reply() {
                Ok(Reply::Data { block, big, data }) => {
                    if big != self.big_blocks {
                        let _ = self.send_to_server(&packet::build_error(
                            ErrorCode::IllegalOperation,
                            "block number width mismatch",
                        ));
                        return Err(TftpError::Protocol(
                            "block number width mismatch".to_string(),
                        ));
                    }
                    return Ok((block, data));
                }
                Ok(_) => {
                    let _ = self.send_to_server(&packet::build_error(
                        ErrorCode::IllegalOperation,
                        "expected DATA",
                    ));
                    return Err(TftpError::Protocol("expected DATA".to_string()));
                }
                Err(TftpError::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(TftpError::Timeout)
    }

    /// Send one DATA block and wait for its acknowledgement.
    fn transfer_block(&mut self, block: u64, chunk: &[u8]) -> Result<()> {
        let wire = self.wire_block(block);
        let data = packet::build_data(wire, self.big_blocks, chunk);
        for attempt in 0..self.opts.retries.max(1) {
            if attempt > 0 {
                warn!(attempt, block, "ACK timeout, re-sending block");
            }
            self.send_to_server(&data)?;
            match self.read_reply() {
                Ok(Reply::Ack { block: b, big }) if big == self.big_blocks && b == wire => {
                    return Ok(());
                }
                Ok(Reply::Ack { block: b, .. }) => {
                    // Stale acknowledgement; resend.
                    debug!(got = b, want = wire, "stale ACK");
                    continue;
                }
                Ok(_) => {
                    return Err(TftpError::Protocol("expected ACK".to_string()));
                }
                Err(TftpError::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(TftpError::Timeout)
    }

    pub(crate) fn send_ack(&mut self, block: u64) -> Result<()> {
        let packet = packet::build_ack(self.wire_block(block), self.big_blocks);
        self.send_to_server(&packet)
    }

    /// Transmit to the server's transfer ID (or the request port before
    /// the first reply).
    pub(crate) fn send_to_server(&mut self, payload: &[u8]) -> Result<()> {
        let write = UdpWrite {
            dest_ip: self.server_ip,
            dest_port: self.server_tid.unwrap_or(self.server_port),
            src_ip: None,
            src_port: Some(self.client_port),
            gateway: None,
        };
        self.stack.udp_write(&write, payload)?;
        Ok(())
    }

    pub(crate) fn wire_block(&self, block: u64) -> u64 {
        if self.big_blocks { block } else { block & 0xffff }
    }
}
