use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ChannelError, Result};

/// Error class used for generic rejections.
pub const ERROR_CLASS: &str = "Error";
/// Error class used when the request data has the wrong type or value.
pub const TYPE_ERROR_CLASS: &str = "TypeError";

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A request from the controller. Every request gets exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(
        rename = "handlerId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub handler_id: Option<String>,
    #[serde(default = "empty_object")]
    pub data: Value,
}

impl Request {
    /// Accept with empty data.
    pub fn accept(&self) -> Response {
        Response::accepted(self.id, empty_object())
    }

    /// Accept with the given data.
    pub fn accept_with(&self, data: Value) -> Response {
        Response::accepted(self.id, data)
    }

    /// Reject with a generic `Error`.
    pub fn reject(&self, reason: impl Into<String>) -> Response {
        Response::rejected(self.id, ERROR_CLASS, reason)
    }

    /// Reject with a `TypeError`.
    pub fn reject_type_error(&self, reason: impl Into<String>) -> Response {
        Response::rejected(self.id, TYPE_ERROR_CLASS, reason)
    }
}

/// The answer to a [`Request`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Response {
    pub fn accepted(id: u32, data: Value) -> Self {
        Self {
            id,
            accepted: true,
            data: Some(data),
            error: None,
            reason: None,
        }
    }

    pub fn rejected(id: u32, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id,
            accepted: false,
            data: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }
}

/// A one-way event, sent in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    #[serde(
        rename = "handlerId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub handler_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Notification {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            handler_id: None,
            data: None,
        }
    }

    pub fn with_handler_id(mut self, handler_id: impl Into<String>) -> Self {
        self.handler_id = Some(handler_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// An inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
}

impl Message {
    /// The method (requests) or event (notifications) name.
    pub fn name(&self) -> &str {
        match self {
            Message::Request(request) => &request.method,
            Message::Notification(notification) => &notification.event,
        }
    }
}

/// Parse an inbound JSON frame.
///
/// Invalid JSON is an error. Valid JSON that is neither a request nor a
/// notification is logged and yields `Ok(None)`.
pub fn parse_message(body: &[u8]) -> Result<Option<Message>> {
    let value: Value = serde_json::from_slice(body).map_err(ChannelError::InvalidJson)?;

    let Value::Object(object) = &value else {
        warn!("ignoring non-object JSON message");
        return Ok(None);
    };

    if object.contains_key("id") {
        match serde_json::from_value::<Request>(value) {
            Ok(request) => Ok(Some(Message::Request(request))),
            Err(err) => {
                warn!(error = %err, "ignoring malformed request");
                Ok(None)
            }
        }
    } else if object.contains_key("event") {
        match serde_json::from_value::<Notification>(value) {
            Ok(notification) => Ok(Some(Message::Notification(notification))),
            Err(err) => {
                warn!(error = %err, "ignoring malformed notification");
                Ok(None)
            }
        }
    } else {
        warn!("ignoring JSON message that is neither request nor notification");
        Ok(None)
    }
}

/// Whether a frame body looks like a request or notification.
pub fn is_message_shaped(body: &[u8]) -> bool {
    if body.first() != Some(&b'{') {
        return false;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => {
            object.contains_key("event")
                || (object.contains_key("id") && object.contains_key("method"))
        }
        _ => false,
    }
}
