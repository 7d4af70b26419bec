//! Length-prefixed frame demux.
//!
//! Wire shape per frame: `[4-byte big-endian length][length bytes]`. The
//! payload starts with one JSON document; bytes after the document (checksums
//! and padding on some deployments) are ignored. Malformed payloads are
//! skipped with a three-strike limit before the stream is declared broken.

use bytes::{Buf, BytesMut};
use kiro_core::GatewayError;
use serde_json::Value;
use tracing::warn;

use kiro_core::config::MAX_FRAME_BYTES;

const MAX_MALFORMED_STREAK: u8 = 3;

#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    malformed_streak: u8,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed. A non-empty remainder at EOF is a
    /// short read.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next decoded frame payload, or `None` when more bytes are
    /// needed.
    pub fn next_frame(&mut self) -> Result<Option<Value>, GatewayError> {
        loop {
            if self.buf.len() < 4 {
                return Ok(None);
            }

            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_FRAME_BYTES {
                return Err(GatewayError::StreamBroken(format!(
                    "frame length {len} exceeds {MAX_FRAME_BYTES} byte cap"
                )));
            }
            if self.buf.len() < 4 + len {
                return Ok(None);
            }

            self.buf.advance(4);
            let payload = self.buf.split_to(len);

            match parse_leading_json(&payload) {
                Some(value) => {
                    self.malformed_streak = 0;
                    return Ok(Some(value));
                }
                None => {
                    self.malformed_streak += 1;
                    warn!(
                        streak = self.malformed_streak,
                        len, "skipping malformed frame payload"
                    );
                    if self.malformed_streak >= MAX_MALFORMED_STREAK {
                        return Err(GatewayError::StreamBroken(format!(
                            "{MAX_MALFORMED_STREAK} consecutive malformed frames"
                        )));
                    }
                    // skip this frame, try the next one
                }
            }
        }
    }
}

/// Parse the leading JSON document of a payload, tolerating trailing bytes.
fn parse_leading_json(payload: &[u8]) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_slice(payload).into_iter::<Value>();
    stream.next()?.ok()
}

/// Build one wire frame for a JSON payload. Shared with tests and mocks.
pub fn encode_frame(payload: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(payload).expect("JSON value always serializes");
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn single_frame_round_trip() {
        let payload = json!({"assistantResponseEvent": {"content": "pong"}});
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode_frame(&payload));
        assert_eq!(drain(&mut decoder), vec![payload]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn frames_split_across_arbitrary_chunk_boundaries() {
        let payloads = vec![
            json!({"assistantResponseEvent": {"content": "a"}}),
            json!({"toolUseEvent": {"toolUseId": "t", "name": "n", "input": "{}", "stop": true}}),
            json!({"messageMetadataEvent": {"contextUsage": 12}}),
        ];
        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend_from_slice(&encode_frame(p));
        }

        // feed one byte at a time, the cruellest chunking
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in wire {
            decoder.push(&[byte]);
            decoded.extend(drain(&mut decoder));
        }
        assert_eq!(decoded, payloads);
    }

    #[test]
    fn trailing_bytes_after_json_are_ignored() {
        let body = br#"{"assistantResponseEvent":{"content":"x"}}garbage-crc"#;
        let mut wire = Vec::new();
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(body);

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["assistantResponseEvent"]["content"], "x");
    }

    #[test]
    fn oversized_length_prefix_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        decoder.push(&[0u8; 8]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn malformed_frames_are_skipped_until_three_in_a_row() {
        let good = json!({"assistantResponseEvent": {"content": "ok"}});
        let bad = b"not json at all";
        let mut wire = Vec::new();
        for _ in 0..2 {
            wire.extend_from_slice(&(bad.len() as u32).to_be_bytes());
            wire.extend_from_slice(bad);
        }
        wire.extend_from_slice(&encode_frame(&good));

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        // two bad frames skipped, good one decoded
        assert_eq!(drain(&mut decoder), vec![good]);

        // a third consecutive malformed frame breaks the stream
        let mut decoder = FrameDecoder::new();
        for _ in 0..3 {
            let mut frame = Vec::new();
            frame.extend_from_slice(&(bad.len() as u32).to_be_bytes());
            frame.extend_from_slice(bad);
            decoder.push(&frame);
        }
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn good_frame_resets_the_malformed_streak() {
        let good = json!({"x": 1});
        let bad = b"@@";
        let mut decoder = FrameDecoder::new();
        for _ in 0..4 {
            let mut frame = Vec::new();
            frame.extend_from_slice(&(bad.len() as u32).to_be_bytes());
            frame.extend_from_slice(bad);
            decoder.push(&frame);
            decoder.push(&encode_frame(&good));
        }
        // alternating bad/good never reaches the streak limit
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 4);
    }
}
