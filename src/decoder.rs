//! Streaming frame extraction
//!
//! The band writes JSON objects over a notification characteristic without
//! any length prefix, so a single notification may carry half a message,
//! several messages, or line noise. `FrameDecoder` accumulates printable
//! text and cuts out `{...}` candidates using a leftmost, non-nested rule:
//! the first `}` after the first `{` closes the frame.
//!
//! Frames are candidates only; validation happens in the interpreter.

use tracing::{debug, warn};

use crate::types::Frame;

/// Default hard cap on buffered characters
pub const DEFAULT_BUFFER_CAP: usize = 2000;

/// Incremental `{...}` extractor over an unbounded byte stream
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    buffer: String,
    cap: usize,
    overflows: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAP)
    }
}

impl FrameDecoder {
    /// Create a decoder whose buffer is reset once it grows past `cap`
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: String::new(),
            cap,
            overflows: 0,
        }
    }

    /// Feed one transport chunk, returning every frame it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let text = printable_text(chunk);
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let (Some(start), Some(close)) = (self.buffer.find('{'), self.buffer.find('}')) {
            let end = close + 1;
            if end > start {
                let frame = Frame::new(self.buffer[start..end].to_string());
                debug!(frame = %frame, "frame extracted");
                frames.push(frame);
                self.buffer.drain(..end);
            } else {
                // Stray `}` ahead of the next `{`: drop the noise and wait for more data
                self.buffer.drain(..start);
                break;
            }
        }

        if self.buffer.len() > self.cap {
            warn!(len = self.buffer.len(), cap = self.cap, "frame buffer overflow, clearing");
            self.buffer.clear();
            self.overflows += 1;
        }

        frames
    }

    /// Drop any partially received frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Characters currently awaiting a closing brace
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Number of times the buffer was discarded for exceeding its cap
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }
}

/// Keep printable ASCII (32..=126) only
fn printable_text(chunk: &[u8]) -> String {
    chunk
        .iter()
        .filter(|b| (32..=126).contains(*b))
        .map(|&b| b as char)
        .collect()
}
