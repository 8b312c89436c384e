//! # Wire Protocol
//!
//! Fixed-layout frame header, the stream reassembler that rebuilds frames
//! from a TCP byte stream, and the connection plumbing both sides share.
//!
//! ## Frame Layout
//!
//! ```text
//! offset  size  field
//!      0     8  seqno
//!      8     8  ts1          originator send time
//!     16     8  ts2          responder receive time (0 until replied)
//!     24     8  ts3          responder send time (0 until replied)
//!     32     4  reply_delay  ns the responder waits before replying
//!     36     2  send_size    total bytes of this frame
//!     38     2  reply_size   total bytes of the reply (0 = no reply)
//! ```
//!
//! Fields are written in host byte order so the tool interoperates with peers
//! built for the same architecture. It is not a portable format: both ends
//! must share endianness. Bytes after the header are padding with no meaning.

use std::fmt;
use thiserror::Error;

pub mod connection;
pub mod reassembler;

pub use connection::{split, write_full, ConnReader, ConnWriter};
pub use reassembler::{FrameReader, Received};

/// Size of the fixed frame header in bytes; every frame is at least this long.
pub const HEADER_SIZE: usize = 40;

const SEQNO_OFFSET: usize = 0;
const TS1_OFFSET: usize = 8;
const TS2_OFFSET: usize = 16;
const TS3_OFFSET: usize = 24;
const REPLY_DELAY_OFFSET: usize = 32;
const SEND_SIZE_OFFSET: usize = 36;
const REPLY_SIZE_OFFSET: usize = 38;

/// Which header field declares the length of the frames being read.
///
/// Repliers read requests, whose length is `send_size`. Originators read
/// replies, whose length is `reply_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeField {
    Send,
    Reply,
}

impl SizeField {
    fn offset(self) -> usize {
        match self {
            SizeField::Send => SEND_SIZE_OFFSET,
            SizeField::Reply => REPLY_SIZE_OFFSET,
        }
    }
}

impl fmt::Display for SizeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeField::Send => write!(f, "send"),
            SizeField::Reply => write!(f, "reply"),
        }
    }
}

/// Errors that end a worker's connection.
///
/// Ordering and timestamp anomalies are deliberately absent: they are logged
/// and counted, never fatal.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection mid-frame ({buffered} of {expected} bytes received)")]
    Truncated { buffered: usize, expected: usize },

    #[error("protocol violation: declared {field} size {size} outside [{min}, {max}]")]
    ProtocolViolation {
        field: SizeField,
        size: usize,
        min: usize,
        max: usize,
    },

    #[error(
        "correlation failure: sent seqno {expected_seqno} ts1 {expected_ts1}, \
         reply carried seqno {seqno} ts1 {ts1}"
    )]
    Correlation {
        expected_seqno: u64,
        expected_ts1: u64,
        seqno: u64,
        ts1: u64,
    },

    #[error("cancelled")]
    Cancelled,
}

/// One protocol message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    pub seqno: u64,
    pub ts1: u64,
    pub ts2: u64,
    pub ts3: u64,
    pub reply_delay: u32,
    pub send_size: u16,
    pub reply_size: u16,
}

impl Frame {
    /// Serialize the header.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[SEQNO_OFFSET..TS1_OFFSET].copy_from_slice(&self.seqno.to_ne_bytes());
        out[TS1_OFFSET..TS2_OFFSET].copy_from_slice(&self.ts1.to_ne_bytes());
        out[TS2_OFFSET..TS3_OFFSET].copy_from_slice(&self.ts2.to_ne_bytes());
        out[TS3_OFFSET..REPLY_DELAY_OFFSET].copy_from_slice(&self.ts3.to_ne_bytes());
        out[REPLY_DELAY_OFFSET..SEND_SIZE_OFFSET].copy_from_slice(&self.reply_delay.to_ne_bytes());
        out[SEND_SIZE_OFFSET..REPLY_SIZE_OFFSET].copy_from_slice(&self.send_size.to_ne_bytes());
        out[REPLY_SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&self.reply_size.to_ne_bytes());
        out
    }

    /// Write the header into the front of `buf`, leaving any padding untouched.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[..HEADER_SIZE].copy_from_slice(&self.encode());
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns `None` while fewer than [`HEADER_SIZE`] bytes are available;
    /// collecting the rest is the reassembler's job.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            seqno: read_u64(buf, SEQNO_OFFSET),
            ts1: read_u64(buf, TS1_OFFSET),
            ts2: read_u64(buf, TS2_OFFSET),
            ts3: read_u64(buf, TS3_OFFSET),
            reply_delay: read_u32(buf, REPLY_DELAY_OFFSET),
            send_size: read_u16(buf, SEND_SIZE_OFFSET),
            reply_size: read_u16(buf, REPLY_SIZE_OFFSET),
        })
    }

    /// Time the responder reports spending between receiving the request and
    /// sending this reply, or `None` if `ts3 < ts2`.
    pub fn responder_time(&self) -> Option<u64> {
        self.ts3.checked_sub(self.ts2)
    }

    /// Round-trip latency of this reply observed at `received_at`:
    /// `(received_at - ts1) - (ts3 - ts2)`.
    ///
    /// Saturates at zero instead of wrapping when the peer reports
    /// inconsistent timestamps.
    pub fn round_trip_latency(&self, received_at: u64) -> u64 {
        let wall = received_at.saturating_sub(self.ts1);
        wall.saturating_sub(self.responder_time().unwrap_or(0))
    }
}

/// Read the declared size field straight out of a buffered header.
pub(crate) fn peek_declared_size(header: &[u8], field: SizeField) -> u16 {
    read_u16(header, field.offset())
}

/// Validate a declared frame size and return the number of bytes the frame
/// occupies on the wire.
///
/// A declared size of 0 means the frame is just the header. Any other value
/// must lie in `[HEADER_SIZE, max_message_size]`.
pub fn frame_len(declared: u16, field: SizeField, max_message_size: usize) -> Result<usize, WireError> {
    let size = declared as usize;
    if size == 0 {
        return Ok(HEADER_SIZE);
    }
    if size < HEADER_SIZE || size > max_message_size {
        return Err(WireError::ProtocolViolation {
            field,
            size,
            min: HEADER_SIZE,
            max: max_message_size,
        });
    }
    Ok(size)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_ne_bytes(bytes)
}
