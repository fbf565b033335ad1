//! Moving framed messages over non-blocking sockets.

use std::io::{self, ErrorKind, Read, Write};

use log::trace;

use crate::codec::{decode_from_slice, encode_to_vec, frame, CodecError, Decode, Encode, FrameBuffer};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Open,
    /// The peer closed its end.
    Closed,
}

/// A non-blocking stream with an inbox that reassembles frames and an
/// outbox of frames not yet written.
pub struct FramedStream<S> {
    stream: S,
    inbox: FrameBuffer,
    outbox: Vec<u8>,
}

impl<S: Read + Write> FramedStream<S> {
    pub fn new(stream: S) -> FramedStream<S> {
        FramedStream {
            stream,
            inbox: FrameBuffer::new(),
            outbox: vec![],
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// For registering the stream with a poll.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Read until the stream would block.
    pub fn read_available(&mut self) -> io::Result<ReadStatus> {
        let mut chunk = vec![0; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    trace!("Read {n} bytes");
                    self.inbox.extend(&chunk[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The next complete message in the inbox.
    pub fn next_message<T: Decode>(&mut self) -> Result<Option<T>, CodecError> {
        match self.inbox.next_frame()? {
            Some(payload) => decode_from_slice(&payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn queue<T: Encode>(&mut self, message: &T) -> Result<(), CodecError> {
        let payload = encode_to_vec(message)?;
        self.outbox.extend(frame(&payload)?);
        Ok(())
    }

    /// Are there queued bytes?
    pub fn wants_write(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Write queued bytes until done or the stream would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.stream.flush()
    }
}
