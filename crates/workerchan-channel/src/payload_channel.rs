use std::os::fd::{AsRawFd, RawFd};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use workerchan_frame::{
    classify, decode_netstring, encode_to_bytes, encoded_len, CloseReason, Consumed, Decoded,
    FrameConfig, FrameKind, ReadStatus, StreamConsumer, UnixStreamReader, UnixStreamWriter,
    WriteStatus, DEFAULT_MAX_FRAME_LEN,
};
use workerchan_transport::PipeEnd;

use crate::channel::{ChannelCloseReason, ChannelStats, InboundCounters, Outbound};
use crate::error::{ChannelError, Result};
use crate::listener::PayloadChannelListener;
use crate::message::{is_message_shaped, parse_message, Message, Notification};

/// Which inbound messages are followed by a payload frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PayloadRule {
    /// Every message carries a payload.
    #[default]
    Always,
    /// Only the listed methods and events carry one.
    Named {
        methods: Vec<String>,
        events: Vec<String>,
    },
}

impl PayloadRule {
    pub fn carries_payload(&self, message: &Message) -> bool {
        match self {
            PayloadRule::Always => true,
            PayloadRule::Named { methods, events } => match message {
                Message::Request(request) => methods.iter().any(|m| *m == request.method),
                Message::Notification(notification) => {
                    events.iter().any(|e| *e == notification.event)
                }
            },
        }
    }
}

/// Configuration for a [`PayloadChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadChannelConfig {
    /// Framing for JSON messages.
    pub frame: FrameConfig,
    /// Maximum payload frame size in bytes. Default: 4 MiB.
    pub max_payload_len: usize,
    pub payload_rule: PayloadRule,
}

impl Default for PayloadChannelConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::payload_channel(),
            max_payload_len: DEFAULT_MAX_FRAME_LEN,
            payload_rule: PayloadRule::default(),
        }
    }
}

/// Receive state.
#[derive(Debug)]
enum Phase {
    Idle,
    /// A message was read; its payload frame comes next. `None` when the
    /// message itself was dropped and only the payload must be skipped.
    AwaitingPayload(Option<Message>),
}

/// The write half of a [`PayloadChannel`].
pub struct PayloadChannelSender {
    out: Outbound,
    inbound: InboundCounters,
    max_frame_len: usize,
    max_payload_len: usize,
    close_requested: bool,
}

impl PayloadChannelSender {
    /// Send a JSON message with no payload.
    pub fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<WriteStatus> {
        let json = serde_json::to_vec(message)?;
        let frame = encode_to_bytes(&json, self.max_frame_len)?;
        self.out.submit(vec![frame])
    }

    /// Send a JSON message followed by its payload.
    ///
    /// Both frames are queued together; nothing sent afterwards can land
    /// between them.
    pub fn send_with_payload<T: Serialize + ?Sized>(
        &mut self,
        message: &T,
        payload: &[u8],
    ) -> Result<WriteStatus> {
        let json = serde_json::to_vec(message)?;
        let header = encode_to_bytes(&json, self.max_frame_len)?;
        let payload = encode_to_bytes(payload, self.max_payload_len)?;
        self.out.submit(vec![header, payload])
    }

    /// Send a notification, with a payload when one is given.
    pub fn notify(
        &mut self,
        event: &str,
        handler_id: Option<&str>,
        data: Option<Value>,
        payload: Option<&[u8]>,
    ) -> Result<WriteStatus> {
        let mut notification = Notification::new(event);
        notification.handler_id = handler_id.map(str::to_string);
        notification.data = data;
        match payload {
            Some(payload) => self.send_with_payload(&notification, payload),
            None => self.send(&notification),
        }
    }

    /// Ask the channel to close once the current dispatch returns.
    pub fn close(&mut self) {
        if !self.close_requested {
            debug!("payload channel close requested");
            self.close_requested = true;
        }
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested
    }

    /// Traffic counters of the channel this sender belongs to.
    pub fn stats(&self) -> ChannelStats {
        self.out.stats(&self.inbound)
    }
}

/// Control channel whose messages may each carry one binary payload.
///
/// A message and its payload travel as two consecutive frames. The reader
/// holds the message until the payload frame arrives and dispatches both
/// together.
pub struct PayloadChannel {
    reader: UnixStreamReader<PipeEnd>,
    sender: PayloadChannelSender,
    listener: Option<Box<dyn PayloadChannelListener>>,
    phase: Phase,
    rule: PayloadRule,
    max_frame_len: usize,
    close_reason: Option<ChannelCloseReason>,
}

impl PayloadChannel {
    /// Create a channel reading from `consumer` and writing to `producer`.
    pub fn new(consumer: PipeEnd, producer: PipeEnd, config: PayloadChannelConfig) -> Result<Self> {
        let consumer_fd = consumer.as_raw_fd();
        let producer_fd = producer.as_raw_fd();

        // The read buffer must hold the largest frame of either kind.
        let read_config = FrameConfig {
            max_frame_len: config.frame.max_frame_len.max(config.max_payload_len),
            ..config.frame.clone()
        };
        let reader = UnixStreamReader::with_config_pipe(consumer, &read_config)?;
        let writer = UnixStreamWriter::with_config_pipe(producer, &config.frame)?;
        debug!(
            consumer_fd,
            producer_fd,
            max_buffer = encoded_len(read_config.max_frame_len),
            "payload channel created"
        );

        Ok(Self {
            reader,
            sender: PayloadChannelSender {
                out: Outbound::new(writer),
                inbound: InboundCounters::default(),
                max_frame_len: config.frame.max_frame_len,
                max_payload_len: config.max_payload_len,
                close_requested: false,
            },
            listener: None,
            phase: Phase::Idle,
            rule: config.payload_rule,
            max_frame_len: config.frame.max_frame_len,
            close_reason: None,
        })
    }

    pub fn set_listener(&mut self, listener: Box<dyn PayloadChannelListener>) {
        self.listener = Some(listener);
    }

    pub fn sender(&mut self) -> &mut PayloadChannelSender {
        &mut self.sender
    }

    /// See [`PayloadChannelSender::send`].
    pub fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<WriteStatus> {
        let result = self.sender.send(message);
        self.check_sender();
        result
    }

    /// See [`PayloadChannelSender::send_with_payload`].
    pub fn send_with_payload<T: Serialize + ?Sized>(
        &mut self,
        message: &T,
        payload: &[u8],
    ) -> Result<WriteStatus> {
        let result = self.sender.send_with_payload(message, payload);
        self.check_sender();
        result
    }

    /// Service a readable notification on the consumer fd.
    pub fn on_readable(&mut self) -> ReadStatus {
        let mut dispatch = PayloadDispatch {
            sender: &mut self.sender,
            listener: self.listener.as_deref_mut(),
            phase: &mut self.phase,
            rule: &self.rule,
            max_frame_len: self.max_frame_len,
            failure: None,
            closed: None,
        };
        let status = self.reader.on_readable(&mut dispatch);
        let PayloadDispatch {
            failure, closed, ..
        } = dispatch;

        if let Some(reason) = closed {
            self.finish(ChannelCloseReason::from_frame_close(reason));
        } else if let Some(err) = failure {
            self.reader.close();
            self.finish(ChannelCloseReason::from_error(&err));
        }
        self.check_sender();

        if self.close_reason.is_some() {
            ReadStatus::Closed
        } else {
            status
        }
    }

    /// Service a writable notification on the producer fd.
    pub fn on_writable(&mut self) -> WriteStatus {
        let status = self.sender.out.flush().unwrap_or(WriteStatus::Dropped);
        self.check_sender();
        status
    }

    pub fn wants_writable(&self) -> bool {
        self.sender.out.has_pending()
    }

    pub fn is_reading(&self) -> bool {
        self.close_reason.is_none() && self.reader.is_reading()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Whether a message is waiting for its payload frame.
    pub fn is_awaiting_payload(&self) -> bool {
        matches!(self.phase, Phase::AwaitingPayload(_))
    }

    pub fn stop_reading(&mut self) {
        self.reader.stop();
    }

    /// Close both directions and discard anything queued or half-received.
    pub fn close(&mut self) {
        self.reader.close();
        self.sender.out.close();
        self.phase = Phase::Idle;
        if self.close_reason.is_none() {
            debug!("payload channel closed");
            self.close_reason = Some(ChannelCloseReason::Requested);
        }
    }

    pub fn close_reason(&self) -> Option<&ChannelCloseReason> {
        self.close_reason.as_ref()
    }

    pub fn stats(&self) -> ChannelStats {
        self.sender.stats()
    }

    pub fn consumer_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    pub fn producer_fd(&self) -> RawFd {
        self.sender.out.raw_fd()
    }

    fn check_sender(&mut self) {
        if let Some(err) = self.sender.out.take_error() {
            self.reader.close();
            self.finish(ChannelCloseReason::Io(err));
        } else if self.sender.close_requested && self.close_reason.is_none() {
            self.reader.close();
            self.finish(ChannelCloseReason::Requested);
        }
    }

    fn finish(&mut self, reason: ChannelCloseReason) {
        if self.close_reason.is_some() {
            return;
        }
        reason.log("payload_channel");
        if let Phase::AwaitingPayload(Some(message)) = &self.phase {
            debug!(name = message.name(), "discarding message awaiting payload");
        }
        self.phase = Phase::Idle;
        let notify = reason.notifies_listener();
        self.close_reason = Some(reason);
        if notify {
            if let Some(listener) = self.listener.as_mut() {
                listener.on_payload_channel_closed();
            }
        }
    }
}

struct PayloadDispatch<'a> {
    sender: &'a mut PayloadChannelSender,
    listener: Option<&'a mut (dyn PayloadChannelListener + 'static)>,
    phase: &'a mut Phase,
    rule: &'a PayloadRule,
    max_frame_len: usize,
    failure: Option<ChannelError>,
    closed: Option<CloseReason>,
}

impl PayloadDispatch<'_> {
    /// Frame size limit for the frame expected next.
    fn frame_limit(&self) -> usize {
        match self.phase {
            Phase::Idle => self.max_frame_len,
            Phase::AwaitingPayload(_) => self.sender.max_payload_len,
        }
    }

    fn on_frame(&mut self, body: &[u8]) -> Result<()> {
        match std::mem::replace(self.phase, Phase::Idle) {
            Phase::Idle => self.on_message_frame(body),
            Phase::AwaitingPayload(ongoing) => {
                if is_message_shaped(body) {
                    return Err(ChannelError::UnexpectedPayloadPhase);
                }
                match ongoing {
                    Some(message) => {
                        trace!(len = body.len(), "payload received");
                        self.deliver(&message, Some(body));
                    }
                    None => {
                        trace!(len = body.len(), "payload of dropped message skipped");
                    }
                }
                Ok(())
            }
        }
    }

    fn on_message_frame(&mut self, body: &[u8]) -> Result<()> {
        match classify(body) {
            FrameKind::Json(json) => match parse_message(json)? {
                Some(message) => {
                    match &message {
                        Message::Request(request) => {
                            self.sender.inbound.requests += 1;
                            debug!(id = request.id, method = %request.method, "request received");
                        }
                        Message::Notification(notification) => {
                            self.sender.inbound.notifications += 1;
                            debug!(event = %notification.event, "notification received");
                        }
                    }
                    if self.rule.carries_payload(&message) {
                        *self.phase = Phase::AwaitingPayload(Some(message));
                    } else {
                        self.deliver(&message, None);
                    }
                }
                None => {
                    self.sender.inbound.dropped += 1;
                    if *self.rule == PayloadRule::Always {
                        *self.phase = Phase::AwaitingPayload(None);
                    }
                }
            },
            FrameKind::Log { severity, message } => {
                self.sender.inbound.peer_logs += 1;
                error!(
                    severity = severity.name(),
                    message = %String::from_utf8_lossy(message),
                    "unexpected log record from peer"
                );
            }
            FrameKind::Empty => return Err(ChannelError::EmptyFrame),
            FrameKind::Unknown(byte) => return Err(ChannelError::UnexpectedFrame(byte)),
        }
        Ok(())
    }

    fn deliver(&mut self, message: &Message, payload: Option<&[u8]>) {
        let Some(listener) = self.listener.as_deref_mut() else {
            warn!(name = message.name(), "no listener for payload channel message");
            return;
        };
        let result = match message {
            Message::Request(request) => listener.on_payload_request(self.sender, request, payload),
            Message::Notification(notification) => {
                listener.on_payload_notification(self.sender, notification, payload)
            }
        };
        if let Err(err) = result {
            warn!(name = message.name(), error = %err, "payload channel handler failed");
        }
    }
}

impl StreamConsumer for PayloadDispatch<'_> {
    fn on_data(&mut self, data: &[u8]) -> workerchan_frame::Result<Consumed> {
        let mut offset = 0;
        loop {
            if self.sender.close_requested || self.failure.is_some() {
                return Ok(Consumed {
                    bytes: offset,
                    pending_frame_len: None,
                    stop_reading: true,
                });
            }

            match decode_netstring(&data[offset..], self.frame_limit())? {
                Decoded::Frame { body, consumed } => {
                    offset += consumed;
                    self.sender.inbound.frames += 1;
                    self.sender.inbound.bytes += consumed as u64;
                    if let Err(err) = self.on_frame(body) {
                        self.failure = Some(err);
                    }
                }
                Decoded::Incomplete { frame_len } => {
                    return Ok(Consumed {
                        bytes: offset,
                        pending_frame_len: frame_len,
                        stop_reading: false,
                    });
                }
            }
        }
    }

    fn on_close(&mut self, reason: CloseReason) {
        self.closed = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::channel::tests::{netstring, pipes, Peer};
    use crate::listener::HandlerResult;
    use crate::message::Request;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Request(Request, Option<Vec<u8>>),
        Notification(Notification, Option<Vec<u8>>),
        Closed,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Rc<RefCell<Vec<Seen>>>,
    }

    impl PayloadChannelListener for Recorder {
        fn on_payload_request(
            &mut self,
            sender: &mut PayloadChannelSender,
            request: &Request,
            payload: Option<&[u8]>,
        ) -> HandlerResult {
            self.seen
                .borrow_mut()
                .push(Seen::Request(request.clone(), payload.map(<[u8]>::to_vec)));
            if request.method == "echo" {
                let data = payload.unwrap_or_default();
                sender.send_with_payload(&request.accept(), data)?;
            }
            Ok(())
        }

        fn on_payload_notification(
            &mut self,
            _sender: &mut PayloadChannelSender,
            notification: &Notification,
            payload: Option<&[u8]>,
        ) -> HandlerResult {
            self.seen.borrow_mut().push(Seen::Notification(
                notification.clone(),
                payload.map(<[u8]>::to_vec),
            ));
            Ok(())
        }

        fn on_payload_channel_closed(&mut self) {
            self.seen.borrow_mut().push(Seen::Closed);
        }
    }

    fn channel_with(config: PayloadChannelConfig) -> (PayloadChannel, Peer, Rc<RefCell<Vec<Seen>>>) {
        let (consumer, producer, peer) = pipes();
        let mut channel = PayloadChannel::new(consumer, producer, config).unwrap();
        let recorder = Recorder::default();
        let seen = Rc::clone(&recorder.seen);
        channel.set_listener(Box::new(recorder));
        (channel, peer, seen)
    }

    fn channel_with_recorder() -> (PayloadChannel, Peer, Rc<RefCell<Vec<Seen>>>) {
        channel_with(PayloadChannelConfig::default())
    }

    #[test]
    fn notification_with_payload() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

        peer.send_frame(br#"{"event":"producer.send","handlerId":"h1"}"#);
        peer.send_frame(&payload);
        assert_eq!(channel.on_readable(), ReadStatus::WouldBlock);

        assert_eq!(
            *seen.borrow(),
            vec![Seen::Notification(
                Notification::new("producer.send").with_handler_id("h1"),
                Some(payload)
            )]
        );
        assert!(!channel.is_awaiting_payload());
    }

    #[test]
    fn message_held_until_payload_arrives() {
        let (mut channel, mut peer, seen) = channel_with_recorder();

        peer.send_frame(br#"{"event":"producer.send"}"#);
        channel.on_readable();
        assert!(seen.borrow().is_empty());
        assert!(channel.is_awaiting_payload());

        let payload = netstring(b"\x00\x01binary");
        for byte in &payload {
            peer.to_worker.write_all(std::slice::from_ref(byte)).unwrap();
            channel.on_readable();
        }

        assert_eq!(seen.borrow().len(), 1);
        assert!(!channel.is_awaiting_payload());
    }

    #[test]
    fn payload_may_look_like_anything_but_a_message() {
        let (mut channel, mut peer, seen) = channel_with_recorder();

        peer.send_frame(br#"{"event":"a"}"#);
        peer.send_frame(br#"{"not":"a message"}"#);
        peer.send_frame(br#"{"event":"b"}"#);
        peer.send_frame(b"");
        peer.send_frame(br#"{"event":"c"}"#);
        peer.send_frame(b"Dnot-a-log");
        channel.on_readable();

        let payloads: Vec<Option<Vec<u8>>> = seen
            .borrow()
            .iter()
            .map(|s| match s {
                Seen::Notification(_, payload) => payload.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            payloads,
            vec![
                Some(br#"{"not":"a message"}"#.to_vec()),
                Some(Vec::new()),
                Some(b"Dnot-a-log".to_vec()),
            ]
        );
    }

    #[test]
    fn message_instead_of_payload_is_protocol_error() {
        let (mut channel, mut peer, seen) = channel_with_recorder();

        peer.send_frame(br#"{"event":"producer.send"}"#);
        peer.send_frame(br#"{"event":"producer.close"}"#);

        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        assert!(matches!(
            channel.close_reason(),
            Some(ChannelCloseReason::ProtocolError(reason)) if reason.contains("awaiting payload")
        ));
    }

    #[test]
    fn named_rule_dispatches_without_payload() {
        let (mut channel, mut peer, seen) = channel_with(PayloadChannelConfig {
            payload_rule: PayloadRule::Named {
                methods: vec!["data.write".to_string()],
                events: vec!["producer.send".to_string()],
            },
            ..PayloadChannelConfig::default()
        });

        peer.send_frame(br#"{"event":"producer.close"}"#);
        peer.send_frame(br#"{"id":1,"method":"data.write"}"#);
        peer.send_frame(b"bytes");
        peer.send_frame(br#"{"id":2,"method":"data.stats"}"#);
        channel.on_readable();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], Seen::Notification(n, None) if n.event == "producer.close"));
        assert!(matches!(&seen[1], Seen::Request(r, Some(p)) if r.id == 1 && p == b"bytes"));
        assert!(matches!(&seen[2], Seen::Request(r, None) if r.id == 2));
    }

    #[test]
    fn dropped_message_skips_its_payload() {
        let (mut channel, mut peer, seen) = channel_with_recorder();

        peer.send_frame(br#"{"unknown":"shape"}"#);
        peer.send_frame(b"\x7fopaque");
        peer.send_frame(br#"{"event":"next"}"#);
        peer.send_frame(b"p");
        assert_eq!(channel.on_readable(), ReadStatus::WouldBlock);

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(channel.stats().dropped, 1);
    }

    #[test]
    fn oversize_payload_closes_channel() {
        let (mut channel, mut peer, seen) = channel_with(PayloadChannelConfig {
            max_payload_len: 8,
            ..PayloadChannelConfig::default()
        });

        peer.send_frame(br#"{"event":"producer.send"}"#);
        peer.to_worker.write_all(b"9:").unwrap();

        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
    }

    #[test]
    fn payload_limit_is_separate_from_message_limit() {
        let (mut channel, mut peer, seen) = channel_with(PayloadChannelConfig {
            frame: FrameConfig {
                max_frame_len: 64,
                ..FrameConfig::payload_channel()
            },
            max_payload_len: 4096,
            ..PayloadChannelConfig::default()
        });

        peer.send_frame(br#"{"event":"producer.send"}"#);
        peer.send_frame(&[7u8; 4096]);
        assert_eq!(channel.on_readable(), ReadStatus::WouldBlock);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn send_with_payload_is_contiguous() {
        let (mut channel, mut peer, seen) = channel_with_recorder();

        peer.send_frame(br#"{"id":9,"method":"echo"}"#);
        peer.send_frame(b"abc");
        channel.on_readable();
        channel
            .sender()
            .notify("after", None, None, Some(b"zz"))
            .unwrap();

        assert_eq!(seen.borrow().len(), 1);
        let frames = peer.read_frames(4);
        let response: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(response, json!({"id": 9, "accepted": true, "data": {}}));
        assert_eq!(frames[1], b"abc");
        assert_eq!(frames[2], br#"{"event":"after"}"#);
        assert_eq!(frames[3], b"zz");
        assert_eq!(channel.stats().frames_sent, 4);
    }

    #[test]
    fn peer_close_mid_message_notifies_once() {
        let (mut channel, mut peer, seen) = channel_with_recorder();

        peer.send_frame(br#"{"event":"producer.send"}"#);
        peer.to_worker.write_all(b"10:part").unwrap();
        channel.on_readable();
        drop(peer);

        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        assert!(!channel.is_awaiting_payload());
        assert_eq!(channel.close_reason(), Some(&ChannelCloseReason::PeerClosed));
    }
}
