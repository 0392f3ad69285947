use crate::channel::ChannelSender;
use crate::error::ChannelError;
use crate::message::{Notification, Request, ERROR_CLASS, TYPE_ERROR_CLASS};
use crate::payload_channel::PayloadChannelSender;

/// Errors returned by listener callbacks.
///
/// They are logged where the channel dispatches and never close the channel.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Generic failure; rejected as `Error`.
    #[error("{0}")]
    Failed(String),

    /// Bad request data; rejected as `TypeError`.
    #[error("{0}")]
    TypeError(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Replying failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    pub fn type_error(reason: impl Into<String>) -> Self {
        HandlerError::TypeError(reason.into())
    }

    /// Error class reported in a rejected response.
    pub fn error_class(&self) -> &'static str {
        match self {
            HandlerError::TypeError(_) => TYPE_ERROR_CLASS,
            _ => ERROR_CLASS,
        }
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Receives messages from a [`Channel`](crate::Channel).
pub trait ChannelListener {
    /// A request; reply through `sender` with the same id.
    fn on_request(&mut self, sender: &mut ChannelSender, request: &Request) -> HandlerResult;

    /// A notification.
    fn on_notification(
        &mut self,
        _sender: &mut ChannelSender,
        _notification: &Notification,
    ) -> HandlerResult {
        Ok(())
    }

    /// The peer closed the channel or broke the protocol. Called once.
    fn on_closed(&mut self) {}
}

/// Receives messages from a [`PayloadChannel`](crate::PayloadChannel).
pub trait PayloadChannelListener {
    /// A request and its payload, if it carries one.
    fn on_payload_request(
        &mut self,
        sender: &mut PayloadChannelSender,
        request: &Request,
        payload: Option<&[u8]>,
    ) -> HandlerResult;

    /// A notification and its payload, if it carries one.
    fn on_payload_notification(
        &mut self,
        _sender: &mut PayloadChannelSender,
        _notification: &Notification,
        _payload: Option<&[u8]>,
    ) -> HandlerResult {
        Ok(())
    }

    /// The peer closed the channel or broke the protocol. Called once.
    fn on_payload_channel_closed(&mut self) {}
}
