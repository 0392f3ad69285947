//! Frame kinds.
//!
//! A frame body is told apart by its first byte: JSON messages always start
//! with `{`, log records start with one of the severity sentinels below. The
//! two sets are disjoint.

use bytes::BytesMut;

use crate::codec::encode_netstring_parts;
use crate::error::Result;

/// First byte of every JSON message frame.
pub const JSON_START: u8 = b'{';

/// Debug log record sentinel.
pub const LOG_DEBUG: u8 = b'D';

/// Warning log record sentinel.
pub const LOG_WARN: u8 = b'W';

/// Error log record sentinel.
pub const LOG_ERROR: u8 = b'E';

/// Dump (unconditional output) log record sentinel.
pub const LOG_DUMP: u8 = b'X';

/// Severity carried by a log record frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSeverity {
    Debug,
    Warn,
    Error,
    Dump,
}

impl LogSeverity {
    /// The sentinel byte that opens a log frame of this severity.
    pub fn sentinel(self) -> u8 {
        match self {
            LogSeverity::Debug => LOG_DEBUG,
            LogSeverity::Warn => LOG_WARN,
            LogSeverity::Error => LOG_ERROR,
            LogSeverity::Dump => LOG_DUMP,
        }
    }

    /// Map a sentinel byte back to its severity.
    pub fn from_sentinel(byte: u8) -> Option<Self> {
        match byte {
            LOG_DEBUG => Some(LogSeverity::Debug),
            LOG_WARN => Some(LogSeverity::Warn),
            LOG_ERROR => Some(LogSeverity::Error),
            LOG_DUMP => Some(LogSeverity::Dump),
            _ => None,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            LogSeverity::Debug => "debug",
            LogSeverity::Warn => "warn",
            LogSeverity::Error => "error",
            LogSeverity::Dump => "dump",
        }
    }
}

/// What a frame body holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    /// A JSON message; the slice is the whole body.
    Json(&'a [u8]),
    /// A log record; `message` excludes the sentinel.
    Log {
        severity: LogSeverity,
        message: &'a [u8],
    },
    /// A zero-length body.
    Empty,
    /// Anything else, with the offending first byte.
    Unknown(u8),
}

/// Classify a frame body by its first byte.
pub fn classify(body: &[u8]) -> FrameKind<'_> {
    match body.first() {
        None => FrameKind::Empty,
        Some(&JSON_START) => FrameKind::Json(body),
        Some(&byte) => match LogSeverity::from_sentinel(byte) {
            Some(severity) => FrameKind::Log {
                severity,
                message: &body[1..],
            },
            None => FrameKind::Unknown(byte),
        },
    }
}

/// Encode a log record frame: sentinel byte followed by the UTF-8 message.
pub fn encode_log(
    severity: LogSeverity,
    message: &str,
    max_len: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    let sentinel = [severity.sentinel()];
    encode_netstring_parts(&[&sentinel[..], message.as_bytes()], max_len, dst)
}
