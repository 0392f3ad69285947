use std::io::{ErrorKind, Read};

use tracing::{debug, trace, warn};
use workerchan_transport::PipeEnd;

use crate::codec::{encoded_len, FrameConfig, CHANNEL_READ_BUFFER, DEFAULT_MAX_FRAME_LEN};
use crate::error::{FrameError, Result};

/// What a consumer took from the unparsed window handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Consumed {
    /// Bytes consumed from the front of the window.
    pub bytes: usize,
    /// Full wire size of the partial frame left behind, when known.
    pub pending_frame_len: Option<usize>,
    /// Stop reading after this delivery.
    pub stop_reading: bool,
}

/// Why a reader closed.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end.
    Eof,
    /// A read failed or the consumer rejected the data.
    Error(FrameError),
}

/// Receives data and closure from a [`UnixStreamReader`].
pub trait StreamConsumer {
    /// Called with every unparsed byte currently buffered.
    fn on_data(&mut self, data: &[u8]) -> Result<Consumed>;

    /// Called exactly once when the reader closes on its own.
    fn on_close(&mut self, reason: CloseReason);
}

/// Reader lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Reading,
    Stopped,
    Closed,
}

/// Outcome of servicing a readable notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The stream is drained; wait for the next readable notification.
    WouldBlock,
    /// Reading was stopped; the stream may still hold data.
    Stopped,
    /// The reader is closed and will not deliver anything else.
    Closed,
}

/// Drains a non-blocking stream into a contiguous buffer and hands the
/// unparsed bytes to a [`StreamConsumer`].
///
/// The buffer starts at the configured capacity and grows on demand up to
/// `max_capacity` when a single pending frame needs more room. Consumed
/// bytes are reclaimed by compaction (shifting unread bytes to offset 0).
pub struct UnixStreamReader<T> {
    inner: T,
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    pending_frame_len: Option<usize>,
    initial_capacity: usize,
    max_capacity: usize,
    state: ReaderState,
    // Set by `start` when frames left behind by a stop are still buffered.
    redeliver: bool,
    bytes_read: u64,
}

impl<T: Read> UnixStreamReader<T> {
    /// Create a reader with control-channel defaults.
    pub fn new(inner: T) -> Self {
        Self::with_capacity(
            inner,
            CHANNEL_READ_BUFFER,
            encoded_len(DEFAULT_MAX_FRAME_LEN),
        )
    }

    /// Create a reader sized for the frames described by `config`.
    pub fn with_config(inner: T, config: &FrameConfig) -> Self {
        Self::with_capacity(
            inner,
            config.read_buffer_capacity,
            encoded_len(config.max_frame_len),
        )
    }

    /// Create a reader with an explicit initial and maximum buffer size.
    pub fn with_capacity(inner: T, capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
            pending_frame_len: None,
            initial_capacity: capacity,
            max_capacity: max_capacity.max(capacity),
            state: ReaderState::Reading,
            redeliver: false,
            bytes_read: 0,
        }
    }

    /// Resume reading after [`stop`](Self::stop). No-op once closed.
    ///
    /// Bytes buffered while stopped are delivered by the next
    /// [`on_readable`](Self::on_readable), before the stream is read again.
    pub fn start(&mut self) {
        if self.state == ReaderState::Stopped {
            self.state = ReaderState::Reading;
            self.redeliver = self.buffered() > 0;
        }
    }

    /// Stop reading; buffered bytes are kept.
    pub fn stop(&mut self) {
        if self.state == ReaderState::Reading {
            self.state = ReaderState::Stopped;
        }
    }

    /// Close without notifying the consumer and release the buffer.
    pub fn close(&mut self) {
        self.state = ReaderState::Closed;
        self.release();
    }

    /// Service a readable notification.
    ///
    /// Reads until the stream would block, delivering the unparsed window
    /// after each successful read. `Ok(0)` from the stream is end-of-file.
    pub fn on_readable<C>(&mut self, consumer: &mut C) -> ReadStatus
    where
        C: StreamConsumer + ?Sized,
    {
        loop {
            match self.state {
                ReaderState::Reading => {}
                ReaderState::Stopped => return ReadStatus::Stopped,
                ReaderState::Closed => return ReadStatus::Closed,
            }

            if self.redeliver {
                self.redeliver = false;
                if let Err(err) = self.deliver(consumer) {
                    self.close_with(consumer, CloseReason::Error(err));
                    return ReadStatus::Closed;
                }
                continue;
            }

            if let Err(err) = self.make_room() {
                self.close_with(consumer, CloseReason::Error(err));
                return ReadStatus::Closed;
            }

            match self.inner.read(&mut self.buf[self.write_pos..]) {
                Ok(0) => {
                    debug!("peer closed stream");
                    self.close_with(consumer, CloseReason::Eof);
                    return ReadStatus::Closed;
                }
                Ok(n) => {
                    self.write_pos += n;
                    self.bytes_read += n as u64;
                    trace!(len = n, buffered = self.buffered(), "read from stream");

                    if let Err(err) = self.deliver(consumer) {
                        self.close_with(consumer, CloseReason::Error(err));
                        return ReadStatus::Closed;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return ReadStatus::WouldBlock,
                Err(err) => {
                    warn!(error = %err, "stream read failed");
                    self.close_with(consumer, CloseReason::Error(FrameError::Io(err)));
                    return ReadStatus::Closed;
                }
            }
        }
    }

    fn deliver<C>(&mut self, consumer: &mut C) -> Result<()>
    where
        C: StreamConsumer + ?Sized,
    {
        let available = self.write_pos - self.read_pos;
        let consumed = consumer.on_data(&self.buf[self.read_pos..self.write_pos])?;

        self.read_pos += consumed.bytes.min(available);
        self.pending_frame_len = consumed.pending_frame_len;

        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
            if self.buf.len() > self.initial_capacity {
                self.buf.truncate(self.initial_capacity);
                self.buf.shrink_to_fit();
            }
        }

        if consumed.stop_reading {
            self.stop();
        }

        if let Some(needed) = self.pending_frame_len {
            if needed > self.max_capacity {
                return Err(FrameError::BufferOverflow {
                    needed,
                    capacity: self.max_capacity,
                });
            }
            if self.read_pos > 0 && self.read_pos + needed > self.buf.len() {
                self.compact();
            }
        }

        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        if self.write_pos < self.buf.len() {
            return Ok(());
        }

        if self.read_pos > 0 {
            self.compact();
            return Ok(());
        }

        // The whole buffer is one unfinished frame: grow it.
        let capacity = self.buf.len();
        let wanted = match self.pending_frame_len {
            Some(needed) if needed > capacity => needed,
            _ => capacity.saturating_mul(2),
        };
        if wanted > self.max_capacity && capacity >= self.max_capacity {
            return Err(FrameError::BufferOverflow {
                needed: wanted,
                capacity: self.max_capacity,
            });
        }

        let new_len = wanted.min(self.max_capacity);
        trace!(from = capacity, to = new_len, "growing read buffer");
        self.buf.resize(new_len, 0);
        Ok(())
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
        trace!(buffered = self.write_pos, "compacted read buffer");
    }

    fn close_with<C>(&mut self, consumer: &mut C, reason: CloseReason)
    where
        C: StreamConsumer + ?Sized,
    {
        if self.state == ReaderState::Closed {
            return;
        }
        self.state = ReaderState::Closed;
        self.release();
        consumer.on_close(reason);
    }

    fn release(&mut self) {
        self.redeliver = false;
        self.buf = Vec::new();
        self.read_pos = 0;
        self.write_pos = 0;
        self.pending_frame_len = None;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Whether the reader is accepting readable notifications.
    pub fn is_reading(&self) -> bool {
        self.state == ReaderState::Reading
    }

    /// Bytes read but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Current buffer size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes read from the stream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl UnixStreamReader<PipeEnd> {
    /// Create a reader for a pipe end, switching it to non-blocking mode.
    pub fn with_config_pipe(inner: PipeEnd, config: &FrameConfig) -> Result<Self> {
        inner
            .set_nonblocking(true)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: workerchan_transport::TransportError) -> FrameError {
    match err {
        workerchan_transport::TransportError::Io(io)
        | workerchan_transport::TransportError::Pipe(io) => FrameError::Io(io),
        workerchan_transport::TransportError::BadDescriptor { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}
