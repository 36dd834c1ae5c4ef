//! Seam to the obfuscation layer.
//!
//! The multiplexer never looks inside the bytes it puts on a physical
//! connection. An [`Obfuscator`] turns a [`Frame`] into an opaque unit,
//! turns a unit back into a frame, and knows where one unit ends in a
//! stream of received bytes. Encryption, padding and record headers all
//! live behind this trait.

use crate::error::{Error, Result};
use crate::frame::{Frame, MAX_FRAME_SIZE};
use bytes::{Bytes, BytesMut};

/// Converts frames to and from the bytes carried by physical connections
pub trait Obfuscator: Send + Sync + 'static {
    /// Serialize a frame into one unit ready to be written to a connection.
    fn obfuscate(&self, frame: &Frame) -> Result<Bytes>;

    /// Rebuild a frame from a unit returned by [`split_unit`](Self::split_unit).
    fn deobfuscate(&self, unit: &[u8]) -> Result<Frame>;

    /// Remove one complete unit from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not hold a whole unit yet. Must never
    /// hand out a partial unit. An error means the byte stream is corrupt and
    /// the connection it came from is dropped.
    fn split_unit(&self, buf: &mut BytesMut) -> Result<Option<BytesMut>>;
}

/// Pass-through obfuscator: each unit is exactly one plain-encoded frame
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainObfuscator;

impl Obfuscator for PlainObfuscator {
    fn obfuscate(&self, frame: &Frame) -> Result<Bytes> {
        frame.encode()
    }

    fn deobfuscate(&self, unit: &[u8]) -> Result<Frame> {
        Frame::decode(unit)
    }

    fn split_unit(&self, buf: &mut BytesMut) -> Result<Option<BytesMut>> {
        let Some(len) = Frame::peek_encoded_len(buf) else {
            return Ok(None);
        };
        if len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "Unit of {} bytes exceeds maximum {}",
                len, MAX_FRAME_SIZE
            )));
        }
        if buf.len() < len {
            return Ok(None);
        }
        Ok(Some(buf.split_to(len)))
    }
}
