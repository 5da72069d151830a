//! TFTP wire codec.
//!
//! RFC 1350 packet layouts plus the RFC 2347/2348/2349 option extension
//! and the private big-block opcodes (DATA8/ACK8) carrying 64-bit block
//! numbers for transfers past the 16-bit wrap.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const TFTP_PORT: u16 = 69;
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard block size
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum

pub const OPT_BLKSIZE: &str = "blksize"; // RFC 2348
pub const OPT_TSIZE: &str = "tsize"; // RFC 2349
pub const OPT_OVERWRITE: &str = "overwrite"; // private: allow WRQ over existing file
pub const OPT_BIGBLK: &str = "bigblk#"; // private: 64-bit block numbers

/// Value sent for `bigblk#`: the private DATA opcode. The server must
/// echo it back verbatim for the extension to take effect.
pub const BIGBLK_VALUE: &str = "8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
    Dir = 7,   // Directory listing request (private)
    Data8 = 8, // Data packet, 64-bit block number (private)
    Ack8 = 9,  // Acknowledgment, 64-bit block number (private)
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            7 => Ok(Opcode::Dir),
            8 => Ok(Opcode::Data8),
            9 => Ok(Opcode::Ack8),
            _ => Err(TftpError::Protocol(format!("invalid opcode: {}", value))),
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8, // RFC 2347
}

/// A packet a server may send to us. Requests and OACKs travelling the
/// other way are built, never parsed.
#[derive(Debug, Clone)]
pub enum Packet {
    Data { block: u64, big: bool, data: Bytes },
    Ack { block: u64, big: bool },
    Oack(Vec<(String, String)>),
    Error { code: u16, message: String },
}

pub fn parse(packet: &[u8]) -> Result<Packet> {
    let mut bytes = Bytes::copy_from_slice(packet);
    if bytes.remaining() < 2 {
        return Err(TftpError::Protocol("packet too small".to_string()));
    }
    let opcode = Opcode::try_from(bytes.get_u16())?;

    match opcode {
        Opcode::Data => {
            if bytes.remaining() < 2 {
                return Err(TftpError::Protocol("truncated DATA".to_string()));
            }
            let block = bytes.get_u16() as u64;
            Ok(Packet::Data {
                block,
                big: false,
                data: bytes,
            })
        }
        Opcode::Data8 => {
            if bytes.remaining() < 8 {
                return Err(TftpError::Protocol("truncated DATA8".to_string()));
            }
            let block = bytes.get_u64();
            Ok(Packet::Data {
                block,
                big: true,
                data: bytes,
            })
        }
        Opcode::Ack => {
            if bytes.remaining() < 2 {
                return Err(TftpError::Protocol("truncated ACK".to_string()));
            }
            Ok(Packet::Ack {
                block: bytes.get_u16() as u64,
                big: false,
            })
        }
        Opcode::Ack8 => {
            if bytes.remaining() < 8 {
                return Err(TftpError::Protocol("truncated ACK8".to_string()));
            }
            Ok(Packet::Ack {
                block: bytes.get_u64(),
                big: true,
            })
        }
        Opcode::Oack => {
            let mut pairs = Vec::new();
            while bytes.has_remaining() {
                let name = parse_cstr(&mut bytes)?;
                let value = parse_cstr(&mut bytes)?;
                pairs.push((name.to_lowercase(), value));
            }
            Ok(Packet::Oack(pairs))
        }
        Opcode::Error => {
            if bytes.remaining() < 2 {
                return Err(TftpError::Protocol("truncated ERROR".to_string()));
            }
            let code = bytes.get_u16();
            let message = if bytes.has_remaining() {
                parse_cstr(&mut bytes)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned())
            } else {
                String::new()
            };
            Ok(Packet::Error { code, message })
        }
        Opcode::Rrq | Opcode::Wrq | Opcode::Dir => Err(TftpError::Protocol(format!(
            "unexpected request opcode from peer: {:?}",
            opcode
        ))),
    }
}

fn parse_cstr(bytes: &mut Bytes) -> Result<String> {
    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::Protocol("no null terminator found".to_string()))?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1); // skip the null terminator

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::Protocol(format!("invalid UTF-8: {}", e)))
}

/// Build an RRQ/WRQ/DIR with null-terminated option name/value pairs
/// (RFC 2347).
pub fn build_request(op: Opcode, filename: &str, options: &[(String, String)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(op as u16);
    packet.put_slice(filename.as_bytes());
    packet.put_u8(0);
    packet.put_slice(b"octet");
    packet.put_u8(0);
    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }
    packet.freeze()
}

pub fn build_ack(block: u64, big: bool) -> Bytes {
    let mut packet = BytesMut::with_capacity(10);
    if big {
        packet.put_u16(Opcode::Ack8 as u16);
        packet.put_u64(block);
    } else {
        packet.put_u16(Opcode::Ack as u16);
        packet.put_u16(block as u16);
    }
    packet.freeze()
}

pub fn build_data(block: u64, big: bool, data: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(10 + data.len());
    if big {
        packet.put_u16(Opcode::Data8 as u16);
        packet.put_u64(block);
    } else {
        packet.put_u16(Opcode::Data as u16);
        packet.put_u16(block as u16);
    }
    packet.put_slice(data);
    packet.freeze()
}

pub fn build_error(code: ErrorCode, message: &str) -> Bytes {
    let mut packet = BytesMut::with_capacity(5 + message.len());
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(code as u16);
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

/// Build an OACK (RFC 2347). Only servers send these on the wire; the
/// builder exists for the scripted-peer tests.
pub fn build_oack(options: &[(&str, &str)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(Opcode::Oack as u16);
    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }
    packet.freeze()
}

/// Options acknowledged by the server in an OACK.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckedOptions {
    pub block_size: Option<usize>,
    pub transfer_size: Option<u64>,
    pub big_blocks: bool,
    pub overwrite: bool,
}

/// Interpret OACK pairs. The server may only acknowledge what we asked
/// for (RFC 2347), and `bigblk#` must come back with the exact value we
/// sent.
pub fn parse_oack_options(pairs: &[(String, String)], requested_big: bool) -> Result<AckedOptions> {
    let mut acked = AckedOptions::default();
    for (name, value) in pairs {
        match name.as_str() {
            OPT_BLKSIZE => {
                let size: usize = value.parse().map_err(|_| {
                    TftpError::Protocol(format!("bad blksize in OACK: {}", value))
                })?;
                if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
                    return Err(TftpError::Protocol(format!(
                        "blksize out of range in OACK: {}",
                        size
                    )));
                }
                acked.block_size = Some(size);
            }
            OPT_TSIZE => {
                acked.transfer_size = Some(value.parse().map_err(|_| {
                    TftpError::Protocol(format!("bad tsize in OACK: {}", value))
                })?);
            }
            OPT_BIGBLK => {
                if !requested_big || value != BIGBLK_VALUE {
                    return Err(TftpError::Protocol(format!(
                        "bad bigblk# acknowledgement: {}",
                        value
                    )));
                }
                acked.big_blocks = true;
            }
            OPT_OVERWRITE => {
                acked.overwrite = true;
            }
            other => {
                return Err(TftpError::Protocol(format!(
                    "server acknowledged unrequested option: {}",
                    other
                )));
            }
        }
    }
    Ok(acked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_conversion() {
        assert_eq!(Opcode::try_from(1).unwrap(), Opcode::Rrq);
        assert_eq!(Opcode::try_from(9).unwrap(), Opcode::Ack8);
        assert!(Opcode::try_from(10).is_err());
        assert!(Opcode::try_from(0).is_err());
    }

    #[test]
    fn request_layout() {
        let options = vec![
            (OPT_BLKSIZE.to_string(), "1024".to_string()),
            (OPT_BIGBLK.to_string(), BIGBLK_VALUE.to_string()),
        ];
        let packet = build_request(Opcode::Rrq, "boot.img", &options);
        assert_eq!(&packet[..2], &[0, 1]);
        assert_eq!(
            &packet[2..],
            b"boot.img\0octet\0blksize\01024\0bigblk#\08\0"
        );
    }

    #[test]
    fn data_roundtrip_both_widths() {
        let small = build_data(7, false, b"abc");
        match parse(&small).unwrap() {
            Packet::Data { block, big, data } => {
                assert_eq!(block, 7);
                assert!(!big);
                assert_eq!(&data[..], b"abc");
            }
            other => panic!("unexpected packet: {other:?}"),
        }

        let wide = build_data(0x1_0000_0001, true, b"xyz");
        match parse(&wide).unwrap() {
            Packet::Data { block, big, data } => {
                assert_eq!(block, 0x1_0000_0001);
                assert!(big);
                assert_eq!(&data[..], b"xyz");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn ack_roundtrip_both_widths() {
        match parse(&build_ack(65535, false)).unwrap() {
            Packet::Ack { block, big } => {
                assert_eq!(block, 65535);
                assert!(!big);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        match parse(&build_ack(1 << 40, true)).unwrap() {
            Packet::Ack { block, big } => {
                assert_eq!(block, 1 << 40);
                assert!(big);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn error_parse() {
        let packet = build_error(ErrorCode::FileNotFound, "no such file");
        match parse(&packet).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, 1);
                assert_eq!(message, "no such file");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn oack_parse_and_interpretation() {
        let packet = build_oack(&[("blksize", "1024"), ("tsize", "4096"), ("bigblk#", "8")]);
        let pairs = match parse(&packet).unwrap() {
            Packet::Oack(pairs) => pairs,
            other => panic!("unexpected packet: {other:?}"),
        };
        let acked = parse_oack_options(&pairs, true).unwrap();
        assert_eq!(acked.block_size, Some(1024));
        assert_eq!(acked.transfer_size, Some(4096));
        assert!(acked.big_blocks);
    }

    #[test]
    fn bigblk_echo_must_be_exact() {
        let pairs = vec![(OPT_BIGBLK.to_string(), "9".to_string())];
        assert!(parse_oack_options(&pairs, true).is_err());

        // Unsolicited bigblk# is also a protocol error.
        let pairs = vec![(OPT_BIGBLK.to_string(), BIGBLK_VALUE.to_string())];
        assert!(parse_oack_options(&pairs, false).is_err());
    }

    #[test]
    fn unrequested_option_rejected() {
        let pairs = vec![("windowsize".to_string(), "4".to_string())];
        assert!(parse_oack_options(&pairs, false).is_err());
    }

    #[test]
    fn inbound_request_opcode_rejected() {
        let packet = build_request(Opcode::Rrq, "x", &[]);
        assert!(parse(&packet).is_err());
    }

    #[test]
    fn truncated_packets_rejected() {
        assert!(parse(&[0]).is_err());
        assert!(parse(&[0, 3, 0]).is_err());
        assert!(parse(&[0, 8, 0, 0, 0, 0]).is_err());
        assert!(parse(&[0, 5, 0]).is_err());
    }
}
