//! Stream reassembly.
//!
//! TCP delivers a byte stream with arbitrary segmentation. [`FrameReader`]
//! turns it back into whole frames, one per [`FrameReader::next_frame`] call,
//! regardless of how the bytes were split across reads.
//!
//! The buffer is sized once to the maximum message size. Each read asks for
//! as much as the current state allows: while the header is incomplete that
//! is enough for a maximum-sized frame, afterwards exactly the remainder of
//! the declared frame. Bytes belonging to the next frame are shifted to the
//! front once the current one is handed out.

use super::{frame_len, peek_declared_size, Frame, SizeField, WireError, HEADER_SIZE};
use crate::clock;
use crate::coordination::CancelToken;
use std::io::{ErrorKind, Read};
use tracing::trace;

/// A whole frame pulled off the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub frame: Frame,
    /// Number of bytes the frame occupied on the wire.
    pub size: usize,
    /// Clock reading taken right after the read that completed the frame.
    pub arrived_at: u64,
}

/// Per-connection reassembly state over any byte source.
pub struct FrameReader<R> {
    reader: R,
    field: SizeField,
    max_message_size: usize,
    buf: Vec<u8>,
    filled: usize,
    last_read_at: u64,
    cancel: Option<CancelToken>,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader that sizes frames by `field`.
    ///
    /// `max_message_size` values below [`HEADER_SIZE`] are raised to it.
    pub fn new(reader: R, field: SizeField, max_message_size: usize) -> Self {
        let max_message_size = max_message_size.max(HEADER_SIZE);
        Self {
            reader,
            field,
            max_message_size,
            buf: vec![0u8; max_message_size],
            filled: 0,
            last_read_at: 0,
            cancel: None,
        }
    }

    /// Make read timeouts check `cancel` and bail out once it is set.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Access the underlying source, e.g. to write replies on the same socket.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Bytes received but not yet handed out as a frame.
    pub fn buffered(&self) -> usize {
        self.filled
    }

    /// Return the next whole frame.
    ///
    /// `Ok(None)` means the peer closed the stream on a frame boundary.
    /// Closing with a partial frame buffered is [`WireError::Truncated`].
    pub fn next_frame(&mut self) -> Result<Option<Received>, WireError> {
        loop {
            let want = if self.filled < HEADER_SIZE {
                (self.max_message_size - HEADER_SIZE).max(HEADER_SIZE - self.filled)
            } else {
                let declared = peek_declared_size(&self.buf[..HEADER_SIZE], self.field);
                let size = frame_len(declared, self.field, self.max_message_size)?;
                if self.filled >= size {
                    return Ok(Some(self.take_frame(size)));
                }
                size - self.filled
            };

            let end = (self.filled + want).min(self.buf.len());
            let n = match self.reader.read(&mut self.buf[self.filled..end]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.is_cancelled() {
                        return Err(WireError::Cancelled);
                    }
                    continue;
                }
                Err(e) => return Err(WireError::Io(e)),
            };

            if n == 0 {
                if self.filled == 0 {
                    return Ok(None);
                }
                let expected = if self.filled < HEADER_SIZE {
                    HEADER_SIZE
                } else {
                    let declared = peek_declared_size(&self.buf[..HEADER_SIZE], self.field);
                    frame_len(declared, self.field, self.max_message_size)?
                };
                return Err(WireError::Truncated {
                    buffered: self.filled,
                    expected,
                });
            }

            self.last_read_at = clock::now();
            self.filled += n;
            trace!("read {} bytes, {} buffered", n, self.filled);
        }
    }

    fn take_frame(&mut self, size: usize) -> Received {
        // frame_len never returns less than HEADER_SIZE.
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buf[..HEADER_SIZE]);
        let frame = Frame::decode(&header).unwrap_or_default();

        self.buf.copy_within(size..self.filled, 0);
        self.filled -= size;

        Received {
            frame,
            size,
            arrived_at: self.last_read_at,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelToken::is_cancelled)
    }
}
