use bytes::{Buf, BytesMut};
use thiserror::Error;

/// A line (or unterminated partial line) grew past the configured ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("line exceeds {limit} bytes without a newline ({buffered} bytes buffered)")]
pub struct LineOverflow {
    pub buffered: usize,
    pub limit: usize,
}

/// Splits a byte stream into newline-delimited lines.
///
/// The output does not depend on how the stream was chunked: a line whose
/// content exceeds `max_line_bytes` overflows whether it arrives complete in
/// one chunk or grows across many.
pub struct LineSplitter {
    buf: BytesMut,
    /// Bytes at the front of `buf` already known to hold no newline
    scanned: usize,
    max_line_bytes: usize,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Feed a chunk, appending every complete line to `out`.
    ///
    /// On overflow the internal buffer is discarded; lines completed before
    /// the oversized one are still in `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<String>) -> Result<(), LineOverflow> {
        self.buf.extend_from_slice(chunk);

        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            if end > self.max_line_bytes {
                return Err(self.overflow(end));
            }
            let line = self.buf.split_to(end);
            self.buf.advance(1);
            self.scanned = 0;
            if let Some(line) = decode_line(&line) {
                out.push(line);
            }
        }

        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line_bytes {
            return Err(self.overflow(self.buf.len()));
        }
        Ok(())
    }

    /// Take whatever partial line remains (end of stream)
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buf.split();
        self.scanned = 0;
        decode_line(&rest)
    }

    /// Bytes currently held for an unterminated line
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn overflow(&mut self, buffered: usize) -> LineOverflow {
        self.buf.clear();
        self.scanned = 0;
        LineOverflow {
            buffered,
            limit: self.max_line_bytes,
        }
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let line = String::from_utf8_lossy(bytes);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}
