//! Codec for encoding/decoding frames
//!
//! Format: [length: u32 big-endian][payload: CBOR map of a `RawFrame`]

use crate::frame::{Frame, FrameError, RawFrame};
use crate::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    Invalid(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the error came from the bytes on the stream rather than the stream itself
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}

/// Frame codec for use with `tokio_util::codec::Framed`
///
/// Every decoded frame has passed [`RawFrame::validate`], and every frame is
/// validated again before it is written.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        // Need at least 4 bytes for length header
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length));
        }

        if src.len() < LENGTH_PREFIX_SIZE + length {
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }

        // Consume the whole frame before parsing so a bad payload never leaves
        // the buffer mid-frame.
        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length);

        let raw: RawFrame = ciborium::from_reader(payload.as_ref())
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        Ok(Some(Frame::try_from(raw)?))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Malformed(format!(
                "stream ended inside a frame ({} bytes buffered)",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let raw = RawFrame::from(frame);
        raw.validate()?;

        let mut payload = Vec::new();
        ciborium::into_writer(&raw, &mut payload)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        if payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
