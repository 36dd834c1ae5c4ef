use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Stream ID carried by frames that only deliver a closing notice
pub const CONTROL_STREAM_ID: u32 = 0;

/// Maximum encoded frame size (64 KB - 1 byte)
pub const MAX_FRAME_SIZE: usize = 65535;

/// Frame header size (stream_id + closing_stream_id + length)
pub const HEADER_SIZE: usize = 10;

/// Maximum payload per frame (accounting for the 10-byte header)
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Multiplexing frame
///
/// Wire format:
/// ```text
/// [stream_id: u32][closing_stream_id: u32][length: u16][payload: bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream the payload belongs to
    pub stream_id: u32,

    /// Non-zero when the sender is closing the stream with this ID
    pub closing_stream_id: u32,

    /// Stream data, may be empty for a pure closing notice
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame carrying stream data
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            closing_stream_id: 0,
            payload,
        }
    }

    /// Create a control frame announcing that `stream_id` is closed
    pub fn closing(stream_id: u32) -> Self {
        Self {
            stream_id: CONTROL_STREAM_ID,
            closing_stream_id: stream_id,
            payload: Bytes::new(),
        }
    }

    /// Frame addressed to no stream
    pub fn is_control(&self) -> bool {
        self.stream_id == CONTROL_STREAM_ID
    }

    /// A frame with neither payload nor closing notice must never hit the wire
    pub fn is_meaningful(&self) -> bool {
        !self.payload.is_empty() || self.closing_stream_id != 0
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes> {
        if !self.is_meaningful() {
            return Err(Error::EmptyFrame);
        }

        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(Error::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.closing_stream_id);
        buf.put_u16(payload_len as u16);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "Frame too short: {} bytes (expected at least {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let mut cursor = std::io::Cursor::new(buf);
        let stream_id = cursor.get_u32();
        let closing_stream_id = cursor.get_u32();
        let length = cursor.get_u16() as usize;

        let remaining = buf.len() - HEADER_SIZE;
        if length != remaining {
            return Err(Error::Protocol(format!(
                "Length mismatch: header says {} bytes, but {} bytes available",
                length, remaining
            )));
        }

        Ok(Self {
            stream_id,
            closing_stream_id,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        })
    }

    /// Total encoded length announced by a header, if `buf` holds one
    pub(crate) fn peek_encoded_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let length = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        Some(HEADER_SIZE + length)
    }
}
