//! Frame reassembly.
//!
//! The negotiation service writes one protocol message per line (`data: <json>`), but the
//! transport hands us chunks split at arbitrary byte offsets. `FrameCodec` keeps the pending
//! tail of the last chunk in the `FramedRead` buffer and only yields complete lines.

use crate::constants::{DATA_PREFIX, MAX_FRAME_BYTES, SNIPPET_CHARS};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// One complete protocol message, with the `data:` prefix removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    /// Set when the line exceeded the decoder limit; `payload` then holds only its head.
    pub truncated: bool,
}

impl Frame {
    /// Accepts a single line (without its `\n`) if it is a protocol message.
    pub fn from_line(line: &[u8]) -> Option<Self> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line);
        let rest = text.strip_prefix(DATA_PREFIX)?;
        let payload = rest.strip_prefix(' ').unwrap_or(rest);
        if payload.trim().is_empty() {
            return None;
        }
        Some(Self {
            payload: payload.to_string(),
            truncated: false,
        })
    }

    fn truncated(head: &[u8]) -> Self {
        let head = String::from_utf8_lossy(head);
        let rest = head.strip_prefix(DATA_PREFIX).unwrap_or(&head);
        Self {
            payload: rest.strip_prefix(' ').unwrap_or(rest).to_string(),
            truncated: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Offset into the buffer up to which we already know there is no newline.
    next_index: usize,
    max_length: usize,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            discarding: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        loop {
            let read_to = std::cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let newline_index = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(newline_index + 1);
                    match Frame::from_line(&line[..newline_index]) {
                        Some(frame) => return Ok(Some(frame)),
                        None => {
                            if newline_index > 0 {
                                tracing::trace!(
                                    "[FRAME] Skipping non-message line ({} bytes)",
                                    newline_index
                                );
                            }
                        }
                    }
                }
                (false, None) if buf.len() > self.max_length => {
                    tracing::warn!(
                        "[FRAME] Line exceeds {} bytes, discarding until next line break",
                        self.max_length
                    );
                    self.discarding = true;
                    if buf.starts_with(DATA_PREFIX.as_bytes()) {
                        let head_len =
                            std::cmp::min(self.max_length, DATA_PREFIX.len() + SNIPPET_CHARS);
                        return Ok(Some(Frame::truncated(&buf[..head_len])));
                    }
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() {
            tracing::debug!(
                "[FRAME] Discarding {} unterminated bytes at end of stream",
                buf.len()
            );
            buf.clear();
        }
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}

pub type FrameStream<S> = FramedRead<StreamReader<S, Bytes>, FrameCodec>;

/// Wraps a chunk stream into a lazy stream of frames. One instance per transport stream.
pub fn frames<S>(chunks: S) -> FrameStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    FramedRead::new(StreamReader::new(chunks), FrameCodec::new())
}
