/// Errors that can occur during netstring framing and stream I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length prefix is not a canonical decimal number followed by ':'.
    #[error("invalid netstring length prefix: {0}")]
    InvalidLength(&'static str),

    /// The declared (or submitted) frame length exceeds the configured maximum.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The byte after the frame body is not the terminating ','.
    #[error("netstring not terminated by ',' (found 0x{found:02x})")]
    MissingTerminator { found: u8 },

    /// A pending frame cannot fit in the read buffer even after compaction.
    #[error("read buffer overflow (frame needs {needed} bytes, capacity {capacity})")]
    BufferOverflow { needed: usize, capacity: usize },

    /// The outgoing queue grew past its bound.
    #[error("write queue full ({queued} bytes queued, max {max})")]
    WriteQueueFull { queued: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream is closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the error means the peer violated the wire protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidLength(_)
                | FrameError::FrameTooLarge { .. }
                | FrameError::MissingTerminator { .. }
                | FrameError::BufferOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
