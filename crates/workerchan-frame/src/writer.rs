use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

use bytes::{Buf, Bytes};
use tracing::{debug, trace, warn};
use workerchan_transport::PipeEnd;

use crate::codec::{FrameConfig, DEFAULT_MAX_WRITE_QUEUE};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

/// Outcome of submitting bytes to a [`UnixStreamWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Everything submitted so far reached the stream.
    Flushed,
    /// Some bytes are queued until the stream is writable again.
    Queued,
    /// The writer is closed; the bytes were discarded.
    Dropped,
}

/// Writes whole buffers to a non-blocking stream, queueing whatever the
/// stream does not accept immediately.
///
/// Buffers are written in submission order and never interleaved. The
/// queue is bounded; exceeding the bound closes the writer.
pub struct UnixStreamWriter<T> {
    inner: T,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    max_queue: usize,
    closed: bool,
    bytes_written: u64,
}

impl<T: Write> UnixStreamWriter<T> {
    /// Create a writer with the default queue bound.
    pub fn new(inner: T) -> Self {
        Self::with_max_queue(inner, DEFAULT_MAX_WRITE_QUEUE)
    }

    /// Create a writer using the queue bound from `config`.
    pub fn with_config(inner: T, config: &FrameConfig) -> Self {
        Self::with_max_queue(inner, config.max_write_queue)
    }

    /// Create a writer with an explicit queue bound in bytes.
    pub fn with_max_queue(inner: T, max_queue: usize) -> Self {
        Self {
            inner,
            queue: VecDeque::new(),
            queued_bytes: 0,
            max_queue,
            closed: false,
            bytes_written: 0,
        }
    }

    /// Submit one buffer.
    ///
    /// Writes immediately when nothing is queued ahead of it. An error
    /// closes the writer; later submissions are dropped.
    pub fn write(&mut self, buf: Bytes) -> Result<WriteStatus> {
        self.write_batch(std::iter::once(buf))
    }

    /// Submit several buffers as one unit.
    ///
    /// All of them are queued before any I/O, so nothing submitted later
    /// can land between them.
    pub fn write_batch<I>(&mut self, bufs: I) -> Result<WriteStatus>
    where
        I: IntoIterator<Item = Bytes>,
    {
        if self.closed {
            trace!("write on closed stream dropped");
            return Ok(WriteStatus::Dropped);
        }

        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            self.queued_bytes += buf.len();
            self.queue.push_back(buf);
        }

        self.flush_and_check()
    }

    /// Service a writable notification by draining the queue.
    pub fn on_writable(&mut self) -> Result<WriteStatus> {
        if self.closed {
            return Ok(WriteStatus::Dropped);
        }
        self.flush_and_check()
    }

    /// Close the writer and discard anything still queued.
    pub fn close(&mut self) {
        if !self.closed && self.queued_bytes > 0 {
            debug!(
                queued = self.queued_bytes,
                "closing stream with unwritten bytes"
            );
        }
        self.closed = true;
        self.queue.clear();
        self.queued_bytes = 0;
    }

    fn flush_and_check(&mut self) -> Result<WriteStatus> {
        match self.flush_queue() {
            Ok(true) => Ok(WriteStatus::Flushed),
            Ok(false) if self.queued_bytes > self.max_queue => {
                let err = FrameError::WriteQueueFull {
                    queued: self.queued_bytes,
                    max: self.max_queue,
                };
                warn!(error = %err, "peer is not draining the stream");
                self.close();
                Err(err)
            }
            Ok(false) => Ok(WriteStatus::Queued),
            Err(err) => {
                warn!(error = %err, "stream write failed");
                self.close();
                Err(err)
            }
        }
    }

    /// Write queued buffers until the queue is empty (`true`) or the
    /// stream would block (`false`).
    fn flush_queue(&mut self) -> Result<bool> {
        while let Some(front) = self.queue.front_mut() {
            match self.inner.write(front) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    front.advance(n);
                    self.queued_bytes -= n;
                    self.bytes_written += n as u64;
                    if front.is_empty() {
                        self.queue.pop_front();
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    trace!(queued = self.queued_bytes, "stream would block");
                    return Ok(false);
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(true)
    }

    /// Whether bytes are waiting for a writable notification.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Bytes waiting in the queue.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Whether the writer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total bytes accepted by the stream.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl UnixStreamWriter<PipeEnd> {
    /// Create a writer for a pipe end, switching it to non-blocking mode.
    pub fn with_config_pipe(inner: PipeEnd, config: &FrameConfig) -> Result<Self> {
        inner
            .set_nonblocking(true)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
