//! Duplex control channels between a worker and its controller.
//!
//! A [`Channel`] carries JSON requests, responses and notifications over a
//! pair of pipes, plus log records from the worker. A [`PayloadChannel`]
//! does the same but lets each inbound message carry one binary payload.
//! Both are driven by readiness notifications; the [`EventLoop`] (feature
//! `runtime`) supplies them from a single-threaded tokio runtime.

pub mod channel;
pub mod error;
#[cfg(feature = "runtime")]
pub mod event_loop;
pub mod listener;
pub mod message;
pub mod payload_channel;
pub mod router;

pub use channel::{Channel, ChannelCloseReason, ChannelConfig, ChannelSender, ChannelStats};
pub use error::{ChannelError, Result};
#[cfg(feature = "runtime")]
pub use event_loop::{EventLoop, EventLoopConfig, ExitReason, LogRecord, DEFAULT_DRAIN_TIMEOUT};
pub use listener::{ChannelListener, HandlerError, HandlerResult, PayloadChannelListener};
pub use message::{parse_message, Message, Notification, Request, Response};
pub use payload_channel::{
    PayloadChannel, PayloadChannelConfig, PayloadChannelSender, PayloadRule,
};
pub use router::Router;
pub use workerchan_frame::{LogSeverity, ReadStatus, WriteStatus};
