use bytes::{Buf, Bytes, BytesMut};

use crate::status::{Result, Status};

/// Default cap on a single decoded message (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Compression flag byte (1) plus big-endian length (4).
const FRAME_HEADER_LEN: usize = 5;

/// Flag value for an uncompressed message. All other values are reserved.
const FLAG_UNCOMPRESSED: u8 = 0;

/// Prefix a payload with the 5-byte frame header.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&[FLAG_UNCOMPRESSED]);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Stateful length-prefix parser.
///
/// `push` accepts byte chunks split at arbitrary points: partial frame
/// tails are buffered across calls and complete payloads come out in
/// receive order. Multiple frames concatenated into one chunk are
/// re-split.
///
/// A reserved compression flag or an over-limit length fails the stream;
/// the internal buffer is drained so a follow-up `push` does not resurface
/// the poisoned bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed a chunk; returns every payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while self.buf.len() >= FRAME_HEADER_LEN {
            let flag = self.buf[0];
            if flag != FLAG_UNCOMPRESSED {
                self.buf.clear();
                return Err(Status::invalid_argument(format!(
                    "unsupported compression flag {flag:#04x}"
                )));
            }

            let len =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if len > self.max_message_size {
                self.buf.clear();
                return Err(Status::invalid_argument(format!(
                    "message of {len} bytes exceeds the limit of {} bytes",
                    self.max_message_size
                )));
            }

            if self.buf.len() < FRAME_HEADER_LEN + len {
                break;
            }

            self.buf.advance(FRAME_HEADER_LEN);
            payloads.push(self.buf.split_to(len).freeze());
        }

        Ok(payloads)
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
