//! Receive-buffer framing shared by every stream protocol the server speaks.
//!
//! A connection appends whatever the socket handed it and then repeatedly asks
//! the codec for complete messages. The codec either consumes exactly one
//! message from the front of the buffer or leaves the buffer untouched and
//! reports that more data is needed. A zero-length socket read is not handled
//! here; the caller treats it as peer close.

use bytes::BytesMut;

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// One protocol's rule for cutting complete messages out of a byte stream.
///
/// `try_extract` must be all-or-nothing: on `Ok(None)` the buffer is
/// unchanged, on `Ok(Some(_))` exactly one message has been split off the
/// front. Errors are protocol violations and close the connection.
pub trait FrameCodec {
    type Frame;
    type Error;

    fn try_extract(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Frame>, Self::Error>;
}

/// Accumulates raw reads and drains every already-complete message per read
/// event, so a single readiness wakeup never leaves parsed-but-unprocessed
/// bytes behind.
pub struct FrameReader<C: FrameCodec> {
    codec: C,
    buf: BytesMut,
}

impl<C: FrameCodec> FrameReader<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Append newly received bytes and extract all complete frames.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<C::Frame>, C::Error> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.codec.try_extract(&mut self.buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
