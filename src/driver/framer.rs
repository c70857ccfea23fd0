//! Inbound line framing.
//!
//! Splits the raw byte stream on `\n`, buffering an incomplete trailing
//! fragment across reads. No line is duplicated or dropped however the
//! stream is fragmented.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Upper bound on a single wire line, terminator included. A stream that
/// never produces a terminator would otherwise grow the remainder without
/// limit.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Decoder that yields `\n`-terminated lines, trimming an optional `\r`.
///
/// Yields the raw line bytes without the terminator. Incomplete trailing
/// input stays in the buffer for the next call.
#[derive(Debug)]
pub struct LineDecoder {
    /// Index of the next byte to check for a terminator.
    next_index: usize,
    /// Maximum line length.
    max_len: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_len: MAX_LINE_LEN,
        }
    }

    /// Create a decoder with a custom maximum line length.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }

    fn too_long(&self, actual: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line of {actual} bytes exceeds the {} byte limit", self.max_len),
        )
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineDecoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        // Look for a terminator starting from where the last call left off.
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let mut line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if line.len() > self.max_len {
                return Err(self.too_long(line.len()));
            }

            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            Ok(Some(line))
        } else {
            self.next_index = src.len();

            if src.len() > self.max_len {
                return Err(self.too_long(src.len()));
            }

            Ok(None)
        }
    }
}

/// Framer owned by one connection: the decoder plus its partial-line
/// remainder. The remainder persists across reads on the same connection
/// only; a fresh connection gets a fresh framer.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
    decoder: LineDecoder,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> io::Result<Vec<BytesMut>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line) = self.decoder.decode(&mut self.buf)? {
            lines.push(line);
        }
        Ok(lines)
    }

    /// Bytes held back waiting for a terminator.
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }
}
