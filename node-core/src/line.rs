// Bounded line assembly for the command protocol
//
// Lines may arrive split over several reads or several to a read. Whatever
// follows the last complete line stays buffered; after an OTA header that
// remainder is the beginning of the firmware payload.

use std::io::{self, ErrorKind, Read};

use thiserror::Error;

/// Longest accepted line including its `\n`; a `\r` before it is not counted.
pub const LINE_CAPACITY: usize = 128;

pub type Line = heapless::Vec<u8, LINE_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("line longer than {LINE_CAPACITY} bytes")]
    TooLong,
}

pub struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
    discarding: bool,
    /// A `\r` was dropped from the last byte of a full buffer.
    held_cr: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
            discarding: false,
            held_cr: false,
        }
    }

    /// Perform one read into the free part of the buffer.
    ///
    /// Returns the number of bytes read; 0 means the peer closed the stream.
    /// Call [`pop_line`](Self::pop_line) until it yields `None` before reading
    /// again.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        debug_assert!(self.len < LINE_CAPACITY, "drain lines before reading");
        loop {
            match reader.read(&mut self.buf[self.len..]) {
                Ok(n) => {
                    self.len += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Next complete line without its `\n` (and `\r`), if one is buffered.
    ///
    /// A line that fills the whole buffer without a terminator is reported once
    /// as [`LineError::TooLong`]; the rest of it, up to the next newline, is
    /// dropped.
    pub fn pop_line(&mut self) -> Option<Result<Line, LineError>> {
        loop {
            match self.buf[..self.len].iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.held_cr = false;
                    let tail_of_overlong = core::mem::replace(&mut self.discarding, false);
                    let mut text = &self.buf[..end];
                    if let [head @ .., b'\r'] = text {
                        text = head;
                    }
                    // end < LINE_CAPACITY, so this always fits
                    let line = Line::from_slice(text).unwrap_or_default();
                    self.consume(end + 1);
                    if tail_of_overlong {
                        continue;
                    }
                    return Some(Ok(line));
                }
                None if self.len == LINE_CAPACITY => {
                    // Possibly the first half of a CRLF; make room for the `\n`
                    if self.buf[LINE_CAPACITY - 1] == b'\r' && !self.held_cr && !self.discarding {
                        self.held_cr = true;
                        self.len -= 1;
                        return None;
                    }
                    self.held_cr = false;
                    self.len = 0;
                    if core::mem::replace(&mut self.discarding, true) {
                        return None;
                    }
                    return Some(Err(LineError::TooLong));
                }
                None => return None,
            }
        }
    }

    /// Bytes received after the last complete line.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Remove and return the bytes received after the last complete line.
    pub fn take_pending(&mut self) -> Line {
        let pending = Line::from_slice(self.pending()).unwrap_or_default();
        self.len = 0;
        pending
    }

    fn consume(&mut self, n: usize) {
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
