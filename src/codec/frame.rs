//! Length-prefixed frames: a big-endian `u32` payload length, then the
//! payload.

use std::io::{ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use super::CodecError;

pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 4;

fn check_len(len: usize) -> Result<u32, CodecError> {
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    Ok(len as u32)
}

/// A payload with its frame header, ready to be queued.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = check_len(payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.write_u32::<BigEndian>(len)?;
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), CodecError> {
    let len = check_len(payload.len())?;
    w.write_u32::<BigEndian>(len)?;
    w.write_all(payload)?;
    Ok(())
}

/// Read one frame from a blocking reader. `None` if the reader ended
/// cleanly before a new frame started.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, CodecError> {
    let len = match r.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_len(len)?;
    let mut payload = vec![0; len];
    r.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Reassembles frames from bytes that arrive in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// The next complete frame's payload, if one has arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&self.buf[..HEADER_LEN]) as usize;
        check_len(len)?;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(payload))
    }
}
