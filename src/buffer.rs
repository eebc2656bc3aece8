//! Inbound read buffer and outbound write queue.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};

/// How [`crate::EventSocket::rebuffer`] merges data back into the read
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebufferMode {
    /// Replace the buffer outright with the given bytes.
    Replace,
    /// Append the given bytes to whatever remains in the buffer.
    Append,
}

/// The read buffer grew past its configured ceiling. The buffer has already
/// been discarded; the connection must close without delivering anything.
#[derive(Debug)]
pub(crate) struct Overflow;

/// Accumulates inbound bytes between recv calls and deferred deliveries.
pub(crate) struct ReadBuffer {
    buf: BytesMut,
    max: usize,
}

impl ReadBuffer {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max,
        }
    }

    /// Configured ceiling, `0` meaning unbounded.
    pub(crate) fn max(&self) -> usize {
        self.max
    }

    /// Append received bytes, enforcing the ceiling. On overflow the whole
    /// buffer is dropped so no partial delivery can happen later.
    pub(crate) fn extend(&mut self, data: &[u8]) -> Result<(), Overflow> {
        self.buf.extend_from_slice(data);
        if self.max != 0 && self.buf.len() > self.max {
            self.buf.clear();
            return Err(Overflow);
        }
        Ok(())
    }

    /// Take ownership of the current contents, leaving an empty buffer.
    pub(crate) fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Push unconsumed bytes back. The ceiling is not re-checked here: the
    /// caller is returning data that already passed through [`Self::extend`].
    pub(crate) fn restore(&mut self, data: &[u8], mode: RebufferMode) {
        match mode {
            RebufferMode::Replace => {
                self.buf.clear();
                self.buf.extend_from_slice(data);
            }
            RebufferMode::Append => self.buf.extend_from_slice(data),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Ordered queue of pending write chunks with partial-send continuation.
pub(crate) struct WriteQueue {
    chunks: VecDeque<Bytes>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Drain chunks through `send` until the queue empties or the socket
    /// stops accepting data.
    ///
    /// A would-block puts the chunk back at the head and stops cleanly. A
    /// partial send puts the unsent suffix back and stops, bounding the work
    /// done per readiness event. Any other error puts the chunk back and
    /// propagates. Returns the number of bytes handed to `send`.
    pub(crate) fn drain(
        &mut self,
        mut send: impl FnMut(&[u8]) -> io::Result<usize>,
    ) -> io::Result<usize> {
        let mut total = 0;
        while let Some(chunk) = self.chunks.pop_front() {
            match send(&chunk) {
                Ok(n) if n < chunk.len() => {
                    total += n;
                    self.chunks.push_front(chunk.slice(n..));
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.chunks.push_front(chunk);
                    break;
                }
                Err(e) => {
                    self.chunks.push_front(chunk);
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    #[cfg(test)]
    fn contents(&self) -> Vec<&[u8]> {
        self.chunks.iter().map(|c| c.as_ref()).collect()
    }
}
