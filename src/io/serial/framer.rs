// src/io/serial/framer.rs
//
// Reassembles application messages from the chunked serial byte stream.
// The firmware emits one JSON object per reading plus free-form text lines
// (boot banners, error strings), so two framings share a single buffer:
// brace-delimited objects and newline-delimited lines.

use serde::Serialize;

/// Hard cap on buffered bytes without a complete message.
pub const MAX_BUFFER_LEN: usize = 10_000;

const OPEN_BRACE: u8 = b'{';
const CLOSE_BRACE: u8 = b'}';
const LINE_END: u8 = b'\n';

// =============================================================================
// Types
// =============================================================================

/// Result of feeding one chunk into the framer
#[derive(Debug, Default)]
pub struct FeedResult {
    /// Complete messages in extraction order
    pub frames: Vec<String>,
    /// Set to the number of bytes discarded when the buffer cap was exceeded
    pub overflow: Option<usize>,
}

/// Counters exposed through the link manager's buffer stats query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub buffered_bytes: usize,
    pub frames_extracted: u64,
    pub overflows: u64,
    pub discarded_bytes: u64,
}

// =============================================================================
// MessageFramer
// =============================================================================

/// Stateful framer for the sensor stream.
///
/// A message that opens with `{` (after optional whitespace) is a
/// brace-matched frame and may span lines. Anything else is a text line
/// ending at the next newline; braces inside it carry no meaning.
pub struct MessageFramer {
    buffer: Vec<u8>,
    max_len: usize,
    frames_extracted: u64,
    overflows: u64,
    discarded_bytes: u64,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(MAX_BUFFER_LEN)
    }
}

impl MessageFramer {
    pub fn new(max_len: usize) -> Self {
        MessageFramer {
            buffer: Vec::new(),
            max_len,
            frames_extracted: 0,
            overflows: 0,
            discarded_bytes: 0,
        }
    }

    /// Feed raw bytes into the framer.
    /// Returns every message completed by this chunk, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedResult {
        self.buffer.extend_from_slice(chunk);

        let mut result = FeedResult::default();
        loop {
            if self.extract_next(&mut result.frames) {
                continue;
            }
            if self.buffer.len() > self.max_len {
                let discarded = self.buffer.len();
                self.buffer.clear();
                self.overflows += 1;
                self.discarded_bytes += discarded as u64;
                result.overflow = Some(discarded);
            }
            break;
        }

        self.frames_extracted += result.frames.len() as u64;
        result
    }

    /// Drop any partially received message.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered_bytes: self.buffer.len(),
            frames_extracted: self.frames_extracted,
            overflows: self.overflows,
            discarded_bytes: self.discarded_bytes,
        }
    }

    /// One extraction pass. Returns true when the buffer shrank.
    ///
    /// The buffer always begins at a message boundary. A brace frame starts
    /// only when `{` is the first non-whitespace byte there; any other text
    /// runs to the next newline, braces included.
    fn extract_next(&mut self, frames: &mut Vec<String>) -> bool {
        let first = self
            .buffer
            .iter()
            .position(|b| !b.is_ascii_whitespace());

        match first {
            Some(start) if self.buffer[start] == OPEN_BRACE => {
                // Leading whitespace, blank lines included, is dropped
                self.extract_braced(start, frames)
            }
            _ => self.extract_line(frames),
        }
    }

    /// Brace-match from `start`. Only literal braces are counted.
    fn extract_braced(&mut self, start: usize, frames: &mut Vec<String>) -> bool {
        let mut depth = 0usize;
        let mut end = None;
        for (i, &byte) in self.buffer.iter().enumerate().skip(start) {
            match byte {
                OPEN_BRACE => depth += 1,
                CLOSE_BRACE => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }

        let Some(end) = end else {
            return false;
        };
        let frame: Vec<u8> = self.buffer.drain(..=end).skip(start).collect();
        frames.push(String::from_utf8_lossy(&frame).into_owned());
        true
    }

    /// Take the next complete line. Blank lines are consumed without output.
    fn extract_line(&mut self, frames: &mut Vec<String>) -> bool {
        let Some(newline) = self.buffer.iter().position(|&b| b == LINE_END) else {
            return false;
        };

        let line: Vec<u8> = self.buffer.drain(..=newline).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if !text.is_empty() {
            frames.push(text.to_string());
        }
        true
    }
}
