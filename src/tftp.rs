// Wire codec for the subset of TFTP (RFC 1350, option extension from RFC 2347) spoken by the
// probe, plus a thin async wrapper around a UDP socket that speaks it.
//
// Every integer on this wire is a big-endian u16. Strings are NUL terminated and carried as raw
// bytes.

use async_io::Async;
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Size of a full DATA block. A shorter block ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode plus block number.
pub const DATA_HEADER_SIZE: usize = 4;

/// The only option this system negotiates: the exact payload length in bytes.
pub const SIZE_OPTION: &str = "size";

const RECV_BUFFER_SIZE: usize = 1024;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the codec or the TFTP socket.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    MalformedPacket(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::MalformedPacket(e) => write!(f, "Malformed packet: {}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

fn malformed<T>(msg: impl Into<String>) -> TftpResult<T> {
    Err(SocketError::MalformedPacket(msg.into()))
}

/// Negotiated options, keyed by lowercased option name.
pub type Options = BTreeMap<String, String>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::WriteZero => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// TFTP opcodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error, Oack }

impl OpCode {
    fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::Oack => 6,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        options: Options,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: Options,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },

    /// An option acknowledgment, the server's answer to a request carrying options.
    OptionAck {
        options: Options,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (buf[..end].iter().map(|&c| char::from(c)).collect(), end)
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

fn push_options(buf: &mut Vec<u8>, options: &Options) {
    for (key, value) in options {
        push_string(buf, key);
        push_string(buf, value);
    }
}

///////////////////////////////////////////////////////////////
// Encoding

fn encode_request(opcode: OpCode, filename: &str, mode: FileMode, options: &Options) -> Vec<u8> {
    let mut buf = Vec::with_capacity(filename.len() + 16);
    buf.extend_from_slice(&opcode.as_u16().to_be_bytes());
    push_string(&mut buf, filename);
    push_string(&mut buf, mode.as_str());
    push_options(&mut buf, options);
    buf
}

/// `0x02 | filename | 0 | mode | 0 | (key | 0 | value | 0)*`
pub fn encode_wrq(filename: &str, mode: FileMode, options: &Options) -> Vec<u8> {
    encode_request(OpCode::Wrq, filename, mode, options)
}

/// `0x03 | block (2 bytes) | chunk`
pub fn encode_data(block: u16, chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + chunk.len());
    buf.extend_from_slice(&OpCode::Data.as_u16().to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(chunk);
    buf
}

/// `0x04 | block (2 bytes)`
pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.extend_from_slice(&OpCode::Ack.as_u16().to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf
}

/// `0x05 | code (2 bytes) | message | 0`
pub fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + message.len());
    buf.extend_from_slice(&OpCode::Error.as_u16().to_be_bytes());
    buf.extend_from_slice(&code.as_u16().to_be_bytes());
    push_string(&mut buf, message);
    buf
}

/// `0x06 | (key | 0 | value | 0)*`
pub fn encode_oack(options: &Options) -> Vec<u8> {
    let mut buf = OpCode::Oack.as_u16().to_be_bytes().to_vec();
    push_options(&mut buf, options);
    buf
}

/// Options for a WRQ announcing a payload of `size` bytes.
pub fn size_options(size: u64) -> Options {
    let mut options = Options::new();
    options.insert(SIZE_OPTION.to_string(), size.to_string());
    options
}

///////////////////////////////////////////////////////////////
// Decoding

/// Splits a datagram into its opcode and the bytes following it.
pub fn decode_header(buf: &[u8]) -> TftpResult<(OpCode, &[u8])> {
    if buf.len() < 2 {
        return malformed(format!("{} byte datagram has no opcode", buf.len()));
    }

    let opcode = match u16_from_buffer(&buf[..2]) {
        1 => OpCode::Rrq,
        2 => OpCode::Wrq,
        3 => OpCode::Data,
        4 => OpCode::Ack,
        5 => OpCode::Error,
        6 => OpCode::Oack,
        raw => return malformed(format!("Unknown opcode retrieved: {raw}")),
    };
    Ok((opcode, &buf[2..]))
}

/// Parses `key\0value\0` pairs until the buffer runs out. A trailing pair that is missing its
/// terminator (or its value) is dropped rather than treated as an error.
pub fn decode_options(buf: &[u8]) -> Options {
    let mut options = Options::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (key, key_end) = string_from_buffer(rest);
        if key_end == rest.len() {
            log::debug!("Ignoring dangling option name {key:?}");
            break;
        }
        rest = &rest[key_end + 1..];

        let (value, value_end) = string_from_buffer(rest);
        if value_end == rest.len() {
            log::debug!("Ignoring option {key:?} with unterminated value");
            break;
        }
        rest = &rest[value_end + 1..];

        options.insert(key.to_lowercase(), value);
    }
    options
}

fn parse_request(buf: &[u8]) -> TftpResult<(String, FileMode, Options)> {
    let (path, path_end) = string_from_buffer(buf);
    if path_end == buf.len() {
        return malformed("Request does not contain a mode, but it needs to!");
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);
    if mode_end == rest.len() {
        return malformed("Mode must be terminated with a null byte!");
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return malformed(format!("Unknown file mode: '{raw_mode}'")),
    };

    Ok((path, mode, decode_options(&rest[mode_end + 1..])))
}

fn parse_block(rest: &[u8], kind: &str) -> TftpResult<u16> {
    if rest.len() < 2 {
        return malformed(format!("{kind} packet is missing its block number"));
    }
    Ok(u16_from_buffer(rest))
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        let (opcode, rest) = decode_header(buf)?;
        match opcode {
            OpCode::Rrq => {
                let (path, mode, options) = parse_request(rest)?;
                Ok(Packet::ReadReq { path, mode, options })
            }
            OpCode::Wrq => {
                let (path, mode, options) = parse_request(rest)?;
                Ok(Packet::WriteReq { path, mode, options })
            }
            OpCode::Data => {
                let block = parse_block(rest, "Data")?;
                let data = &rest[2..];
                if data.len() > DATA_BUFFER_SIZE {
                    return malformed(format!(
                        "Data block {block} carries {} bytes, more than {DATA_BUFFER_SIZE}",
                        data.len()
                    ));
                }
                Ok(Packet::Data { block, data: data.to_vec() })
            }
            OpCode::Ack => Ok(Packet::Ack { block: parse_block(rest, "Ack")? }),
            OpCode::Error => {
                let raw = parse_block(rest, "Error")?;
                let (message, _) = string_from_buffer(&rest[2..]);
                Ok(Packet::Error { code: ErrorCode::from_u16(raw), message })
            }
            OpCode::Oack => Ok(Packet::OptionAck { options: decode_options(rest) }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode, options } => encode_request(OpCode::Rrq, path, *mode, options),
            Packet::WriteReq { path, mode, options } => encode_wrq(path, *mode, options),
            Packet::Data { block, data } => encode_data(*block, data),
            Packet::Ack { block } => encode_ack(*block),
            Packet::Error { code, message } => encode_error(*code, message),
            Packet::OptionAck { options } => encode_oack(options),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Binds an ephemeral port on the unspecified address of the same family as `peer`.
    pub fn bind_for(peer: SocketAddr) -> TftpResult<TftpSocket> {
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => ([0u16; 8], 0).into(),
        };
        TftpSocket::bind(local)
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<usize> {
        Ok(self.sock.send_to(&packet.to_bytes(), dst).await?)
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        let packet = Packet::parse_from_buf(&buf[..total_written])?;
        Ok((packet, src))
    }
}
