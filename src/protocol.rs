use std::collections::HashMap;

use anyhow::{Result, anyhow};

/// TFTP opcodes per RFC 1350 + RFC 2347.
const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

/// Well-known TFTP server port (RFC 1350).
pub const TFTP_PORT: u16 = 69;

/// Default data payload per DATA packet (RFC 1350).
pub const BLOCK_SIZE: usize = 512;

/// Smallest negotiable blksize (RFC 2348).
pub const MIN_BLKSIZE: usize = 8;

/// Maximum negotiable blksize (largest payload that fits in a UDP datagram
/// with standard IP + UDP headers: 65535 - 20 - 8 - 4 = 65503, but the
/// common convention is 65464).
pub const MAX_BLKSIZE: usize = 65464;

/// Maximum UDP datagram size we ever expect (4-byte header + max blksize).
pub const MAX_PACKET: usize = 4 + MAX_BLKSIZE;

/// Consecutive timeouts tolerated on the same expected reply before a
/// transfer is abandoned.
pub const MAX_RETRANSMITS: u32 = 5;

/// TFTP error codes per RFC 1350 + RFC 2347.
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
    OptionsDenied = 8,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Decode a big-endian u16 from one or two bytes. Empty input yields 0.
pub fn decode_u16(bytes: &[u8]) -> u16 {
    match *bytes {
        [hi, lo, ..] => u16::from_be_bytes([hi, lo]),
        [lo] => u16::from(lo),
        [] => 0,
    }
}

/// Encode a u16 as two big-endian bytes.
pub fn encode_u16(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ {
        filename: String,
        mode: String,
        options: HashMap<String, String>,
    },
    WRQ {
        filename: String,
        mode: String,
        options: HashMap<String, String>,
    },
    DATA {
        block_num: u16,
        data: Vec<u8>,
    },
    ACK {
        block_num: u16,
    },
    ERROR {
        code: u16,
        msg: String,
    },
    /// Option Acknowledgment (RFC 2347).
    OACK {
        options: HashMap<String, String>,
    },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(anyhow!("packet too short"));
        }
        let opcode = decode_u16(&buf[..2]);
        match opcode {
            OPCODE_RRQ => parse_request(buf, true),
            OPCODE_WRQ => parse_request(buf, false),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            OPCODE_OACK => parse_oack(buf),
            _ => Err(anyhow!("unknown opcode {opcode}")),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_RRQ, filename, mode, options),
            Packet::WRQ {
                filename,
                mode,
                options,
            } => encode_request(OPCODE_WRQ, filename, mode, options),
            Packet::DATA { block_num, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&encode_u16(OPCODE_DATA));
                buf.extend_from_slice(&encode_u16(*block_num));
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&encode_u16(OPCODE_ACK));
                buf.extend_from_slice(&encode_u16(*block_num));
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&encode_u16(OPCODE_ERROR));
                buf.extend_from_slice(&encode_u16(*code));
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
            Packet::OACK { options } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&encode_u16(OPCODE_OACK));
                for (key, val) in options {
                    buf.extend_from_slice(key.as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(val.as_bytes());
                    buf.push(0);
                }
                buf
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

/// Parse RRQ / WRQ: 2-byte opcode | filename\0 | mode\0 [| option\0 | value\0 ]*
fn parse_request(buf: &[u8], is_rrq: bool) -> Result<Packet> {
    let payload = &buf[2..];
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();

    if fields.len() < 2 {
        return Err(anyhow!("missing filename or mode"));
    }

    let filename = String::from_utf8(fields[0].to_vec())?;
    let mode = String::from_utf8(fields[1].to_vec())?.to_ascii_lowercase();

    if filename.is_empty() {
        return Err(anyhow!("empty filename"));
    }

    // Parse RFC 2347 options (key-value pairs after mode). Option names are
    // case-insensitive on the wire; a trailing unpaired field is dropped.
    let mut options = HashMap::new();
    let mut i = 2;
    while i + 1 < fields.len() {
        let key = String::from_utf8(fields[i].to_vec())?.to_ascii_lowercase();
        let val = String::from_utf8(fields[i + 1].to_vec())?;
        if !key.is_empty() {
            options.insert(key, val);
        }
        i += 2;
    }

    if is_rrq {
        Ok(Packet::RRQ {
            filename,
            mode,
            options,
        })
    } else {
        Ok(Packet::WRQ {
            filename,
            mode,
            options,
        })
    }
}

/// Parse DATA: 2-byte opcode | 2-byte block# | 0‥N bytes
fn parse_data(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("DATA packet too short"));
    }
    let block_num = decode_u16(&buf[2..4]);
    let data = buf[4..].to_vec();
    Ok(Packet::DATA { block_num, data })
}

/// Parse ACK: 2-byte opcode | 2-byte block#
fn parse_ack(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("ACK packet too short"));
    }
    let block_num = decode_u16(&buf[2..4]);
    Ok(Packet::ACK { block_num })
}

/// Parse ERROR: 2-byte opcode | 2-byte code | msg\0
///
/// The message is everything up to, not including, the terminating NUL.
fn parse_error(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("ERROR packet too short"));
    }
    let code = decode_u16(&buf[2..4]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(msg_bytes.len());
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::ERROR { code, msg })
}

/// Parse OACK: 2-byte opcode | [option\0 | value\0]*
fn parse_oack(buf: &[u8]) -> Result<Packet> {
    let payload = &buf[2..];
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    let mut options = HashMap::new();
    let mut i = 0;
    while i + 1 < fields.len() {
        let key = String::from_utf8(fields[i].to_vec())?.to_ascii_lowercase();
        let val = String::from_utf8(fields[i + 1].to_vec())?;
        if !key.is_empty() {
            options.insert(key, val);
        }
        i += 2;
    }
    Ok(Packet::OACK { options })
}

fn encode_request(
    opcode: u16,
    filename: &str,
    mode: &str,
    options: &HashMap<String, String>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&encode_u16(opcode));
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    for (key, val) in options {
        buf.extend_from_slice(key.to_ascii_lowercase().as_bytes());
        buf.push(0);
        buf.extend_from_slice(val.as_bytes());
        buf.push(0);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_big_endian_width() {
        assert_eq!(encode_u16(0x1234), [0x12, 0x34]);
        assert_eq!(encode_u16(16), [0, 16]);
        assert_eq!(decode_u16(&[0x12, 0x34]), 0x1234);
        // A single byte is the low byte.
        assert_eq!(decode_u16(&[7]), 7);
        assert_eq!(decode_u16(&[]), 0);
        for x in [0u16, 1, 255, 256, 0x7fff, 0xffff] {
            assert_eq!(decode_u16(&encode_u16(x)), x);
        }
    }

    #[test]
    fn round_trip_rrq() {
        let pkt = Packet::RRQ {
            filename: "hello.txt".into(),
            mode: "octet".into(),
            options: HashMap::new(),
        };
        let bytes = pkt.to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_wrq_with_options() {
        let mut options = HashMap::new();
        options.insert("blksize".to_string(), "1428".to_string());
        options.insert("tsize".to_string(), "1800".to_string());
        let pkt = Packet::WRQ {
            filename: "upload.bin".into(),
            mode: "octet".into(),
            options,
        };
        let bytes = pkt.to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_data() {
        let pkt = Packet::DATA {
            block_num: 42,
            data: vec![1, 2, 3],
        };
        let bytes = pkt.to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_empty_data() {
        // A zero-length DATA terminates transfers that are an exact multiple
        // of the block size; it must survive the codec.
        let pkt = Packet::DATA {
            block_num: 9,
            data: Vec::new(),
        };
        let bytes = pkt.to_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_ack() {
        let pkt = Packet::ACK { block_num: 7 };
        let bytes = pkt.to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_error() {
        let pkt = Packet::ERROR {
            code: ErrorCode::FileNotFound.code(),
            msg: "File not found".into(),
        };
        let bytes = pkt.to_bytes();
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn error_message_stops_at_nul() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_u16(5));
        buf.extend_from_slice(&encode_u16(2));
        buf.extend_from_slice(b"denied\0trailing garbage");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::ERROR { code, msg } => {
                assert_eq!(code, 2);
                assert_eq!(msg, "denied");
            }
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_oack() {
        let mut options = HashMap::new();
        options.insert("blksize".to_string(), "8192".to_string());
        let pkt = Packet::OACK { options };
        let bytes = pkt.to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), pkt);
    }

    #[test]
    fn parse_rrq_with_blksize_option() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_u16(1));
        buf.extend_from_slice(b"test.bin\0octet\0BLKSIZE\08192\0");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::RRQ {
                filename, options, ..
            } => {
                assert_eq!(filename, "test.bin");
                // Names are case-insensitive on input.
                assert_eq!(options.get("blksize").unwrap(), "8192");
            }
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn parse_rrq_drops_unpaired_option() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_u16(1));
        buf.extend_from_slice(b"test.bin\0octet\0blksize\0");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::RRQ { options, .. } => assert!(options.is_empty()),
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn rejects_short_and_unknown() {
        assert!(Packet::from_bytes(&[]).is_err());
        assert!(Packet::from_bytes(&[0]).is_err());
        assert!(Packet::from_bytes(&[0, 3, 0]).is_err()); // truncated DATA
        assert!(Packet::from_bytes(&[0, 9, 0, 0]).is_err()); // unknown opcode
        assert!(Packet::from_bytes(&[0, 1, b'f']).is_err()); // RRQ without mode
    }
}
