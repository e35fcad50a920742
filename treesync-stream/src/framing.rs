//! Line framing for the push stream.
//!
//! Wire format:
//! ```text
//! ┌───────────┬───┬─────────────────────┬────┐
//! │ line type │ : │ JSON payload        │ \n │
//! │ "2"|"data"│   │ or the [DONE] mark  │    │
//! └───────────┴───┴─────────────────────┴────┘
//! ```
//!
//! Chunks arrive at arbitrary boundaries (including mid-UTF-8 sequence),
//! so bytes are buffered until a newline completes a line. Garbage lines
//! are dropped with a warning; they never fail the stream.

use serde_json::Value;
use thiserror::Error;

/// Short line-type prefix.
pub const SHORT_LINE_TYPE: &str = "2";
/// Long line-type prefix; carries the same payload shapes as the short one.
pub const LONG_LINE_TYPE: &str = "data";
/// Payload that ends the stream gracefully.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Payload(Value),
    Done,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("line has no type prefix: {0:?}")]
    MissingPrefix(String),
    #[error("unrecognized line type {0:?}")]
    UnknownLineType(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Decode one complete line (without its trailing newline).
///
/// Blank lines decode to `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<Frame>, FrameError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (line_type, payload) = line
        .split_once(':')
        .ok_or_else(|| FrameError::MissingPrefix(preview(line)))?;
    let line_type = line_type.trim();
    if line_type != SHORT_LINE_TYPE && line_type != LONG_LINE_TYPE {
        return Err(FrameError::UnknownLineType(preview(line_type)));
    }
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Ok(Some(Frame::Done));
    }
    serde_json::from_str(payload)
        .map(|v| Some(Frame::Payload(v)))
        .map_err(|e| FrameError::InvalidJson(e.to_string()))
}

/// Encode a payload as one wire line, newline included.
pub fn encode_line(payload: &Value) -> String {
    format!("{SHORT_LINE_TYPE}:{payload}\n")
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

/// Longest line [`LineDecoder`] buffers by default.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Incremental decoder from byte chunks to frames.
///
/// Every byte is scanned once. A line longer than the limit is dropped
/// as it grows, and its remainder is skipped up to the next newline.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    /// Inside an overlong line that was already dropped.
    skipping: bool,
    dropped_lines: u64,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            skipping: false,
            dropped_lines: 0,
        }
    }

    /// Feed a chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
            let line = &rest[..newline];
            rest = &rest[newline + 1..];
            if std::mem::take(&mut self.skipping) {
                continue;
            }
            if self.buffer.len() + line.len() > self.max_line_bytes {
                self.buffer.clear();
                self.drop_line(FrameError::LineTooLong(self.max_line_bytes));
                continue;
            }
            let frame = if self.buffer.is_empty() {
                self.decode_bytes(line)
            } else {
                let mut full = std::mem::take(&mut self.buffer);
                full.extend_from_slice(line);
                self.decode_bytes(&full)
            };
            frames.extend(frame);
        }

        if !self.skipping && !rest.is_empty() {
            if self.buffer.len() + rest.len() > self.max_line_bytes {
                self.buffer.clear();
                self.skipping = true;
                self.drop_line(FrameError::LineTooLong(self.max_line_bytes));
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }
        frames
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Vec<Frame> {
        self.skipping = false;
        let rest = std::mem::take(&mut self.buffer);
        self.decode_bytes(&rest).into_iter().collect()
    }

    /// Drop any partial line, e.g. after the connection was torn down.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            log::debug!("Discarding {} bytes of partial line", self.buffer.len());
        }
        self.buffer.clear();
        self.skipping = false;
    }

    /// Bytes waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Lines dropped as malformed since creation.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    fn decode_bytes(&mut self, line: &[u8]) -> Option<Frame> {
        let decoded = std::str::from_utf8(line)
            .map_err(|_| FrameError::InvalidUtf8)
            .and_then(decode_line);
        match decoded {
            Ok(frame) => frame,
            Err(e) => {
                self.drop_line(e);
                None
            }
        }
    }

    fn drop_line(&mut self, error: FrameError) {
        self.dropped_lines += 1;
        log::warn!("Dropping stream line: {error}");
    }
}
