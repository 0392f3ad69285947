use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::ChannelSender;
use crate::listener::{ChannelListener, HandlerError, HandlerResult};
use crate::message::{Notification, Request, Response};

type RequestHandler = Box<dyn FnMut(&mut ChannelSender, &Request) -> Result<Value, HandlerError>>;
type NotificationHandler = Box<dyn FnMut(&mut ChannelSender, &Notification) -> HandlerResult>;
type CloseHandler = Box<dyn FnMut()>;

/// A [`ChannelListener`] that routes requests by method and notifications
/// by event.
///
/// Every request is answered: a handler's `Ok(data)` becomes an accepted
/// response, its `Err` a rejected one. Requests for unregistered methods
/// are rejected.
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, RequestHandler>,
    events: HashMap<String, NotificationHandler>,
    on_close: Vec<CloseHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for requests with this method.
    pub fn method<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&mut ChannelSender, &Request) -> Result<Value, HandlerError> + 'static,
    {
        self.methods.insert(method.into(), Box::new(handler));
        self
    }

    /// Register a handler for notifications with this event.
    pub fn event<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&mut ChannelSender, &Notification) -> HandlerResult + 'static,
    {
        self.events.insert(event.into(), Box::new(handler));
        self
    }

    /// Register a callback for when the peer closes the channel.
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: FnMut() + 'static,
    {
        self.on_close.push(Box::new(handler));
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

impl ChannelListener for Router {
    fn on_request(&mut self, sender: &mut ChannelSender, request: &Request) -> HandlerResult {
        let response = match self.methods.get_mut(&request.method) {
            Some(handler) => match handler(sender, request) {
                Ok(data) => request.accept_with(data),
                Err(err) => {
                    warn!(id = request.id, method = %request.method, error = %err, "request rejected");
                    Response::rejected(request.id, err.error_class(), err.to_string())
                }
            },
            None => {
                warn!(id = request.id, method = %request.method, "unknown method");
                request.reject(format!("unknown method '{}'", request.method))
            }
        };

        sender.send(&response)?;
        Ok(())
    }

    fn on_notification(
        &mut self,
        sender: &mut ChannelSender,
        notification: &Notification,
    ) -> HandlerResult {
        match self.events.get_mut(&notification.event) {
            Some(handler) => handler(sender, notification),
            None => {
                debug!(event = %notification.event, "ignoring unhandled notification");
                Ok(())
            }
        }
    }

    fn on_closed(&mut self) {
        for handler in &mut self.on_close {
            handler();
        }
    }
}
