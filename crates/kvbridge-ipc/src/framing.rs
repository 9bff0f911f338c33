//! Newline framing over a byte stream.
//!
//! Reads arrive in arbitrary chunks. [`LineBuffer`] accumulates them and
//! hands out one line per complete frame, keeping any partial tail for the
//! next read.

use bytes::{Bytes, BytesMut};

use kvbridge_core::wire::FRAME_DELIMITER;

/// Default upper bound for a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Accumulates bytes and splits them into delimiter-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: BytesMut,
    max_frame_len: usize,
    /// Bytes already scanned for a delimiter.
    scanned: usize,
    /// Skipping the remainder of an oversized frame.
    discarding: bool,
}

/// A partial frame grew past the configured bound and was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTooLong {
    /// Bytes dropped.
    pub discarded: usize,
}

impl LineBuffer {
    /// Create a buffer with the default frame bound.
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a buffer with a custom frame bound.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_len,
            scanned: 0,
            discarding: false,
        }
    }

    /// Append a chunk.
    ///
    /// If the pending partial frame exceeds the bound it is dropped, along
    /// with the rest of that frame, and the buffer resynchronizes after the
    /// next delimiter.
    pub fn extend(&mut self, mut chunk: &[u8]) -> Result<(), FrameTooLong> {
        if self.discarding {
            let Some(pos) = chunk.iter().position(|&b| b == FRAME_DELIMITER) else {
                return Ok(());
            };
            self.discarding = false;
            chunk = &chunk[pos + 1..];
        }
        self.buffer.extend_from_slice(chunk);
        let tail_start = self
            .buffer
            .iter()
            .rposition(|&b| b == FRAME_DELIMITER)
            .map_or(0, |pos| pos + 1);
        let tail_len = self.buffer.len() - tail_start;
        if tail_len > self.max_frame_len {
            self.buffer.truncate(tail_start);
            self.scanned = self.scanned.min(self.buffer.len());
            self.discarding = true;
            return Err(FrameTooLong {
                discarded: tail_len,
            });
        }
        Ok(())
    }

    /// Pop the next complete line, without its delimiter or a trailing `\r`.
    pub fn next_line(&mut self) -> Option<Bytes> {
        let offset = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == FRAME_DELIMITER);
        let Some(offset) = offset else {
            self.scanned = self.buffer.len();
            return None;
        };
        let newline_pos = self.scanned + offset;
        let mut line = self.buffer.split_to(newline_pos + 1);
        self.scanned = 0;
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    /// Bytes held for an incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
