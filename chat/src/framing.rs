//! Pluggable byte framing. The delivery core only deals in whole payloads; how
//! they are delimited on the wire (raw socket lines, WebSocket frames, ...) is
//! decided by the [`Reader`] and [`Writer`] strategies handed to each user.

use bytes::{BufMut, BytesMut};
use courier_rt::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::error::TransportError;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One encoded application message.
    Data(String),
    /// Transport level frame with no application payload (keep-alive, ping).
    Control,
}

/// Per-connection decoding state.
pub trait FrameDecoder: Send {
    /// Pulls one frame out of `src`. `Ok(None)` means more bytes are needed.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError>;
}

/// Creates a decoder for every connection it is attached to.
pub trait Reader: Send + Sync {
    fn reader(&self) -> Box<dyn FrameDecoder>;
}

pub trait Writer: Send + Sync {
    /// Appends the framed `payload` to `dst`.
    fn write(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), TransportError>;
}

/// Newline delimited framing for raw sockets. Blank lines are keep-alives.
#[derive(Debug, Clone, Copy)]
pub struct LineFraming {
    max_length: usize,
}

impl LineFraming {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Default for LineFraming {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Reader for LineFraming {
    fn reader(&self) -> Box<dyn FrameDecoder> {
        Box::new(LineDecoder(LinesCodec::new_with_max_length(self.max_length)))
    }
}

impl Writer for LineFraming {
    fn write(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), TransportError> {
        if payload.len() > self.max_length {
            return Err(TransportError::FrameTooLong);
        }
        dst.reserve(payload.len() + 1);
        dst.put_slice(payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

struct LineDecoder(LinesCodec);

impl FrameDecoder for LineDecoder {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.0.decode(src) {
            Ok(Some(line)) if line.trim().is_empty() => Ok(Some(Frame::Control)),
            Ok(Some(line)) => Ok(Some(Frame::Data(line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Err(TransportError::FrameTooLong),
            Err(LinesCodecError::Io(e)) => Err(e.into()),
        }
    }
}
