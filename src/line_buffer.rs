//! Newline framing for byte streams.
//!
//! Serial ports and pipes deliver bytes in arbitrary chunks: one read can end
//! in the middle of a line, or carry several lines at once. [`LineBuffer`]
//! accumulates chunks and only hands out complete, newline-terminated lines.
//! A trailing partial line stays buffered until its newline arrives; it is
//! never emitted on its own.

use bytes::BytesMut;
use tracing::warn;

/// Default upper bound for a single protocol line.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Accumulates raw bytes and splits them into complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    max_line: usize,
    /// Set while dropping the remainder of an overlong line.
    discarding: bool,
}

impl LineBuffer {
    /// Create a buffer that drops lines longer than `max_line` bytes.
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_line.min(4096)),
            max_line,
            discarding: false,
        }
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Lines are returned without the `\n` / `\r\n` terminator. Invalid UTF-8
    /// is replaced rather than rejected so one corrupt byte cannot stall the
    /// stream.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if pos > self.max_line {
                warn!(len = pos, max = self.max_line, "Dropping overlong line");
                continue;
            }
            let text = String::from_utf8_lossy(&raw[..pos]);
            lines.push(text.trim_end_matches('\r').to_string());
        }

        if self.buf.len() > self.max_line {
            if !self.discarding {
                warn!(max = self.max_line, "Line exceeds limit, discarding until next newline");
            }
            self.discarding = true;
            self.buf.clear();
        }

        lines
    }

    /// Number of buffered bytes that do not yet form a complete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}
