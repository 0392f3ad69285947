//! Netstring framing over non-blocking Unix streams.
//!
//! Every message on the wire is a netstring: `<len>:<body>,` where `len` is
//! the decimal byte length of `body`. Bodies are either JSON messages
//! (starting with `{`) or log records (starting with a severity sentinel).
//!
//! The reader and writer here never block. They are driven by readiness
//! notifications from an event loop and hand complete bytes to their
//! consumers; no partial frames ever reach user code.

pub mod codec;
pub mod error;
pub mod kind;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_netstring, encode_netstring, encode_netstring_parts, encode_to_bytes, encoded_len,
    Decoded, FrameConfig, CHANNEL_READ_BUFFER, DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_WRITE_QUEUE,
    PAYLOAD_CHANNEL_READ_BUFFER,
};
pub use error::{FrameError, Result};
pub use kind::{classify, encode_log, FrameKind, LogSeverity, JSON_START};
pub use reader::{CloseReason, Consumed, ReadStatus, ReaderState, StreamConsumer, UnixStreamReader};
pub use writer::{UnixStreamWriter, WriteStatus};
