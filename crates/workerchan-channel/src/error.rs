/// Errors that can occur on a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] workerchan_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] workerchan_frame::FrameError),

    /// An inbound JSON frame is not valid JSON.
    #[error("invalid JSON message: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Outbound serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame starts with a byte that is neither `{` nor a log sentinel.
    #[error("unexpected frame starting with byte 0x{0:02x}")]
    UnexpectedFrame(u8),

    /// A zero-length frame.
    #[error("empty frame")]
    EmptyFrame,

    /// A message arrived where a payload frame was expected.
    #[error("message frame received while awaiting payload")]
    UnexpectedPayloadPhase,

    /// Event loop I/O error.
    #[error("event loop I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the error means the peer violated the wire protocol.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            ChannelError::Frame(err) => err.is_protocol_error(),
            ChannelError::InvalidJson(_)
            | ChannelError::UnexpectedFrame(_)
            | ChannelError::EmptyFrame
            | ChannelError::UnexpectedPayloadPhase => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
