//! MLLP frame codec for use with `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Start-of-block byte (VT).
pub const START_BLOCK: u8 = 0x0B;
/// End-of-block byte (FS).
pub const END_BLOCK: u8 = 0x1C;
/// Frame terminator, also the HL7 segment separator.
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Errors produced while framing or unframing MLLP data.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("expected 0x{expected:02X} after end block, got 0x{got:02X}")]
    UnexpectedByte { expected: u8, got: u8 },

    #[error("stream ended inside an MLLP frame")]
    UnexpectedEof,

    #[error("no start block in buffered data")]
    MissingStartBlock,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Streaming MLLP codec.
///
/// Decoding is permissive about leading garbage: bytes before the start
/// block are discarded. The end block must be immediately followed by CR;
/// anything else is a framing error. Encoding is idempotent, a payload that
/// already begins with a start block is passed through unchanged.
#[derive(Debug, Default)]
pub struct MllpCodec;

impl MllpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MllpCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        // Discard anything before the start block.
        match src.iter().position(|&b| b == START_BLOCK) {
            Some(pos) => {
                if pos > 0 {
                    src.advance(pos);
                }
            }
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let Some(end) = src.iter().position(|&b| b == END_BLOCK) else {
            return Ok(None);
        };

        // Need one more byte after EB to validate the terminator.
        if src.len() < end + 2 {
            return Ok(None);
        }

        let terminator = src[end + 1];
        if terminator != CARRIAGE_RETURN {
            // Drop the broken frame so the next decode resynchronises on the
            // following start block.
            src.advance(end + 2);
            return Err(CodecError::UnexpectedByte {
                expected: CARRIAGE_RETURN,
                got: terminator,
            });
        }

        let mut frame = src.split_to(end + 2);
        frame.advance(1); // SB
        frame.truncate(frame.len() - 2); // EB CR
        Ok(Some(frame.freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // decode discards everything up to a start block, so leftover
            // bytes always mean a truncated frame.
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::UnexpectedEof),
        }
    }
}

impl Encoder<Bytes> for MllpCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        // Already wrapped, or nothing to wrap.
        if payload.is_empty() || payload[0] == START_BLOCK {
            dst.extend_from_slice(&payload);
            return Ok(());
        }

        dst.reserve(payload.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.extend_from_slice(&payload);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}

/// Wrap a payload in an MLLP frame. Idempotent.
pub fn wrap(payload: &[u8]) -> Bytes {
    let mut codec = MllpCodec::new();
    let mut buf = BytesMut::with_capacity(payload.len() + 3);
    // Encoding into a fresh buffer cannot fail.
    codec
        .encode(Bytes::copy_from_slice(payload), &mut buf)
        .expect("mllp encode is infallible");
    buf.freeze()
}
