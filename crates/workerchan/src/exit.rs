use std::fmt;

use workerchan_channel::{ChannelError, ExitReason};
use workerchan_transport::TransportError;

// Exit codes the controller interprets.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const SETTINGS: i32 = 42;
pub const DATA_INVALID: i32 = 60;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::InvalidDescriptor(_) | TransportError::DuplicateDescriptor(_) => {
            CliError::new(SETTINGS, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    if err.is_protocol_error() {
        return CliError::new(DATA_INVALID, format!("{context}: {err}"));
    }
    match err {
        ChannelError::Transport(err) => transport_error(context, err),
        ChannelError::Frame(_) | ChannelError::Io(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

/// Exit code for a finished event loop.
pub fn exit_code(reason: &ExitReason) -> i32 {
    match reason {
        ExitReason::PeerClosed | ExitReason::Requested | ExitReason::Signal => SUCCESS,
        ExitReason::ProtocolError(_) => DATA_INVALID,
        ExitReason::IoError(_) => FAILURE,
    }
}
