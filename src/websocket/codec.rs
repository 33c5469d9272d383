//! Turns raw WebSocket frames into gateway payloads.
//!
//! With `compress=zlib-stream` the server sends one zlib stream for the whole
//! connection, split into binary frames. A message is complete when the
//! buffered input ends with [`ZLIB_SUFFIX`]; the inflater keeps its window
//! across messages, so it must only be reset together with the connection.

use crate::error::{ConnectorError, Result};
use crate::types::GatewayPayload;
use flate2::{Decompress, FlushDecompress, Status};
use log::trace;

/// Sync-flush marker that ends every zlib-stream message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const INFLATE_CHUNK: usize = 32 * 1024;
const INITIAL_BUFFER: usize = 8 * 1024;
/// Buffers that grew past this after a large message are reallocated.
const BUFFER_RETAIN_LIMIT: usize = 1024 * 1024;

pub struct GatewayFrameCodec {
    zlib_stream: bool,
    inflater: Decompress,
    input: Vec<u8>,
    output: Vec<u8>,
}

impl GatewayFrameCodec {
    pub fn new(zlib_stream: bool) -> Self {
        Self {
            zlib_stream,
            inflater: Decompress::new(true),
            input: Vec::with_capacity(INITIAL_BUFFER),
            output: Vec::with_capacity(INITIAL_BUFFER),
        }
    }

    pub fn is_zlib_stream(&self) -> bool {
        self.zlib_stream
    }

    /// Text frames always carry one complete JSON payload.
    pub fn decode_text(&mut self, text: &str) -> Result<GatewayPayload> {
        parse_payload(text.as_bytes())
    }

    /// Feeds one binary frame. Returns `None` while a compressed message is
    /// still incomplete.
    pub fn decode_binary(&mut self, frame: &[u8]) -> Result<Option<GatewayPayload>> {
        if !self.zlib_stream {
            return parse_payload(frame).map(Some);
        }

        self.input.extend_from_slice(frame);
        if !self.input.ends_with(&ZLIB_SUFFIX) {
            trace!("Buffered {} compressed bytes, waiting for suffix", self.input.len());
            return Ok(None);
        }

        let inflated = self.inflate();
        self.input.clear();
        inflated?;

        let payload = parse_payload(&self.output);
        self.output.clear();
        self.shrink_buffers();
        payload.map(Some)
    }

    /// Drops buffered input and starts a fresh zlib context. Call whenever
    /// the underlying connection is replaced.
    pub fn reset(&mut self) {
        self.inflater = Decompress::new(true);
        self.input.clear();
        self.output.clear();
        self.shrink_buffers();
    }

    fn inflate(&mut self) -> Result<()> {
        self.output.clear();
        let mut consumed = 0;
        loop {
            if self.output.capacity() - self.output.len() < INFLATE_CHUNK {
                self.output.reserve(INFLATE_CHUNK);
            }
            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = self.inflater.decompress_vec(
                &self.input[consumed..],
                &mut self.output,
                FlushDecompress::Sync,
            )?;
            let read = (self.inflater.total_in() - before_in) as usize;
            let written = (self.inflater.total_out() - before_out) as usize;
            consumed += read;

            let input_done = consumed >= self.input.len();
            let output_has_room = self.output.len() < self.output.capacity();
            match status {
                Status::StreamEnd => return Ok(()),
                _ if input_done && output_has_room => return Ok(()),
                _ if read == 0 && written == 0 && !input_done => {
                    return Err(ConnectorError::DecodeError(
                        "zlib inflater made no progress".to_string(),
                    ));
                }
                _ => {}
            }
        }
    }

    fn shrink_buffers(&mut self) {
        if self.input.capacity() > BUFFER_RETAIN_LIMIT {
            self.input = Vec::with_capacity(INITIAL_BUFFER);
        }
        if self.output.capacity() > BUFFER_RETAIN_LIMIT {
            self.output = Vec::with_capacity(INITIAL_BUFFER);
        }
    }
}

fn parse_payload(bytes: &[u8]) -> Result<GatewayPayload> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ConnectorError::DecodeError(format!("payload is not UTF-8: {}", e)))?;
    serde_json::from_str(text)
        .map_err(|e| ConnectorError::DecodeError(format!("invalid gateway payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpCode;
    use flate2::{Compress, Compression, FlushCompress};
    use serde_json::json;

    fn compress_message(compressor: &mut Compress, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 1024);
        compressor
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&ZLIB_SUFFIX));
        out
    }

    fn dispatch_text(seq: u64) -> String {
        json!({
            "op": 0,
            "s": seq,
            "t": "MESSAGE_CREATE",
            "d": {"content": "hello gateway ".repeat(20)}
        })
        .to_string()
    }

    #[test]
    fn test_reassembles_split_messages_on_one_stream() {
        for frames in 1..=10 {
            let mut compressor = Compress::new(Compression::default(), true);
            let mut codec = GatewayFrameCodec::new(true);

            for seq in 1..=2 {
                let compressed = compress_message(&mut compressor, &dispatch_text(seq));
                let chunk_size = (compressed.len() + frames - 1) / frames;
                let chunks: Vec<&[u8]> = compressed.chunks(chunk_size.max(1)).collect();

                let (last, head) = chunks.split_last().unwrap();
                for chunk in head {
                    assert_eq!(codec.decode_binary(chunk).unwrap(), None);
                }
                let payload = codec
                    .decode_binary(last)
                    .unwrap()
                    .expect("final frame completes the message");
                assert_eq!(payload.op, OpCode::Dispatch);
                assert_eq!(payload.s, Some(seq));
            }
        }
    }

    #[test]
    fn test_text_and_plain_binary_frames() {
        let mut codec = GatewayFrameCodec::new(false);
        let text = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        assert_eq!(codec.decode_text(text).unwrap().op, OpCode::Hello);
        let payload = codec.decode_binary(text.as_bytes()).unwrap().unwrap();
        assert_eq!(payload.op, OpCode::Hello);
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let mut codec = GatewayFrameCodec::new(false);
        assert!(matches!(
            codec.decode_text("{not json"),
            Err(ConnectorError::DecodeError(_))
        ));
        assert!(matches!(
            codec.decode_binary(&[0xff, 0xfe]),
            Err(ConnectorError::DecodeError(_))
        ));
    }

    #[test]
    fn test_unknown_op_code_still_decodes() {
        let mut codec = GatewayFrameCodec::new(false);
        let payload = codec.decode_text(r#"{"op":5,"d":null}"#).unwrap();
        assert_eq!(payload.op, OpCode::Unknown(5));
    }

    #[test]
    fn test_corrupt_zlib_data_errors() {
        let mut codec = GatewayFrameCodec::new(true);
        let mut garbage = vec![0x12, 0x34, 0x56, 0x78, 0x9a];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(codec.decode_binary(&garbage).is_err());
    }

    #[test]
    fn test_reset_starts_a_new_stream() {
        let mut codec = GatewayFrameCodec::new(true);
        let mut first = Compress::new(Compression::default(), true);
        let compressed = compress_message(&mut first, &dispatch_text(1));
        codec.decode_binary(&compressed).unwrap().unwrap();

        // A new connection means a new zlib header.
        codec.reset();
        let mut second = Compress::new(Compression::default(), true);
        let compressed = compress_message(&mut second, &dispatch_text(5));
        let payload = codec.decode_binary(&compressed).unwrap().unwrap();
        assert_eq!(payload.s, Some(5));
    }
}
