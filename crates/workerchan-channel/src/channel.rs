use std::os::fd::{AsRawFd, RawFd};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use workerchan_frame::{
    classify, decode_netstring, encode_log, encode_to_bytes, CloseReason, Consumed, Decoded,
    FrameConfig, FrameError, FrameKind, LogSeverity, ReadStatus, StreamConsumer,
    UnixStreamReader, UnixStreamWriter, WriteStatus,
};
use workerchan_transport::PipeEnd;

use crate::error::{ChannelError, Result};
use crate::listener::ChannelListener;
use crate::message::{parse_message, Message, Notification};

/// Configuration for a [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub frame: FrameConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::channel(),
        }
    }
}

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCloseReason {
    /// The peer closed its end.
    PeerClosed,
    /// Closed locally, by a listener or the owner.
    Requested,
    /// The peer violated the wire protocol.
    ProtocolError(String),
    /// Reading or writing failed.
    Io(String),
}

impl ChannelCloseReason {
    pub(crate) fn from_frame_close(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Eof => ChannelCloseReason::PeerClosed,
            CloseReason::Error(err) if err.is_protocol_error() => {
                ChannelCloseReason::ProtocolError(err.to_string())
            }
            CloseReason::Error(err) => ChannelCloseReason::Io(err.to_string()),
        }
    }

    pub(crate) fn from_error(err: &ChannelError) -> Self {
        if err.is_protocol_error() {
            ChannelCloseReason::ProtocolError(err.to_string())
        } else {
            ChannelCloseReason::Io(err.to_string())
        }
    }

    pub(crate) fn log(&self, channel: &'static str) {
        match self {
            ChannelCloseReason::PeerClosed => debug!(channel, "peer closed channel"),
            ChannelCloseReason::Requested => debug!(channel, "channel closed on request"),
            ChannelCloseReason::ProtocolError(reason) => {
                error!(channel, reason = %reason, "protocol error, closing channel")
            }
            ChannelCloseReason::Io(reason) => {
                warn!(channel, reason = %reason, "I/O error, closing channel")
            }
        }
    }

    /// Whether listeners hear about this closure.
    pub(crate) fn notifies_listener(&self) -> bool {
        !matches!(self, ChannelCloseReason::Requested)
    }
}

/// Traffic counters for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub requests: u64,
    pub notifications: u64,
    pub peer_logs: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct InboundCounters {
    pub bytes: u64,
    pub frames: u64,
    pub requests: u64,
    pub notifications: u64,
    pub peer_logs: u64,
    pub dropped: u64,
}

/// Write side shared by both channel kinds.
pub(crate) struct Outbound {
    writer: UnixStreamWriter<PipeEnd>,
    frames_sent: u64,
    write_error: Option<String>,
}

impl Outbound {
    pub(crate) fn new(writer: UnixStreamWriter<PipeEnd>) -> Self {
        Self {
            writer,
            frames_sent: 0,
            write_error: None,
        }
    }

    pub(crate) fn submit(&mut self, frames: Vec<Bytes>) -> Result<WriteStatus> {
        let count = frames.len() as u64;
        let len: usize = frames.iter().map(Bytes::len).sum();
        match self.writer.write_batch(frames) {
            Ok(WriteStatus::Dropped) => Ok(WriteStatus::Dropped),
            Ok(status) => {
                self.frames_sent += count;
                trace!(len, ?status, "frames submitted");
                Ok(status)
            }
            Err(err) => Err(self.record(err)),
        }
    }

    pub(crate) fn flush(&mut self) -> Result<WriteStatus> {
        self.writer.on_writable().map_err(|err| self.record(err))
    }

    fn record(&mut self, err: FrameError) -> ChannelError {
        self.write_error.get_or_insert_with(|| err.to_string());
        err.into()
    }

    pub(crate) fn take_error(&mut self) -> Option<String> {
        self.write_error.take()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.writer.has_pending()
    }

    pub(crate) fn close(&mut self) {
        self.writer.close();
    }

    pub(crate) fn stats(&self, inbound: &InboundCounters) -> ChannelStats {
        ChannelStats {
            bytes_received: inbound.bytes,
            bytes_sent: self.writer.bytes_written(),
            frames_received: inbound.frames,
            frames_sent: self.frames_sent,
            requests: inbound.requests,
            notifications: inbound.notifications,
            peer_logs: inbound.peer_logs,
            dropped: inbound.dropped,
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.writer.get_ref().as_raw_fd()
    }
}

/// The write half of a [`Channel`], handed to listeners for replies.
pub struct ChannelSender {
    out: Outbound,
    inbound: InboundCounters,
    max_frame_len: usize,
    close_requested: bool,
}

impl ChannelSender {
    /// Serialize `message` as JSON and send it as one frame.
    pub fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<WriteStatus> {
        let json = serde_json::to_vec(message)?;
        self.send_raw(&json)
    }

    /// Send an already serialized JSON message.
    pub fn send_raw(&mut self, json: &[u8]) -> Result<WriteStatus> {
        let frame = encode_to_bytes(json, self.max_frame_len)?;
        self.out.submit(vec![frame])
    }

    /// Send a log record to the peer.
    pub fn send_log(&mut self, severity: LogSeverity, message: &str) -> Result<WriteStatus> {
        let mut buf = BytesMut::with_capacity(message.len() + 16);
        encode_log(severity, message, self.max_frame_len, &mut buf)?;
        self.out.submit(vec![buf.freeze()])
    }

    /// Send a notification.
    pub fn notify(
        &mut self,
        event: &str,
        handler_id: Option<&str>,
        data: Option<Value>,
    ) -> Result<WriteStatus> {
        let mut notification = Notification::new(event);
        notification.handler_id = handler_id.map(str::to_string);
        notification.data = data;
        self.send(&notification)
    }

    /// Ask the channel to close once the current dispatch returns.
    ///
    /// Frames already read but not yet dispatched are discarded. Pending
    /// writes stay queued so the owner can drain them.
    pub fn close(&mut self) {
        if !self.close_requested {
            debug!("channel close requested");
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

/// JSON control channel over a pair of pipes.
pub struct Channel {
    reader: UnixStreamReader<PipeEnd>,
    sender: ChannelSender,
    listener: Option<Box<dyn ChannelListener>>,
    max_frame_len: usize,
    close_reason: Option<ChannelCloseReason>,
}

impl Channel {
    /// Create a channel reading from `consumer` and writing to `producer`.
    ///
    /// Both ends are switched to non-blocking mode.
    pub fn new(consumer: PipeEnd, producer: PipeEnd, config: ChannelConfig) -> Result<Self> {
        let consumer_fd = consumer.as_raw_fd();
        let producer_fd = producer.as_raw_fd();
        let reader = UnixStreamReader::with_config_pipe(consumer, &config.frame)?;
        let writer = UnixStreamWriter::with_config_pipe(producer, &config.frame)?;
        debug!(consumer_fd, producer_fd, "channel created");

        Ok(Self {
            reader,
            sender: ChannelSender {
                out: Outbound::new(writer),
                inbound: InboundCounters::default(),
                max_frame_len: config.frame.max_frame_len,
                close_requested: false,
            },
            listener: None,
            max_frame_len: config.frame.max_frame_len,
            close_reason: None,
        })
    }

    /// Install the listener that receives inbound messages.
    pub fn set_listener(&mut self, listener: Box<dyn ChannelListener>) {
        self.listener = Some(listener);
    }

    /// The write half.
    pub fn sender(&mut self) -> &mut ChannelSender {
        &mut self.sender
    }

    /// See [`ChannelSender::send`].
    pub fn send<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<WriteStatus> {
        let result = self.sender.send(message);
        self.check_sender();
        result
    }

    /// See [`ChannelSender::send_log`].
    pub fn send_log(&mut self, severity: LogSeverity, message: &str) -> Result<WriteStatus> {
        let result = self.sender.send_log(severity, message);
        self.check_sender();
        result
    }

    /// See [`ChannelSender::notify`].
    pub fn notify(
        &mut self,
        event: &str,
        handler_id: Option<&str>,
        data: Option<Value>,
    ) -> Result<WriteStatus> {
        let result = self.sender.notify(event, handler_id, data);
        self.check_sender();
        result
    }

    /// Service a readable notification on the consumer fd.
    pub fn on_readable(&mut self) -> ReadStatus {
        let mut dispatch = Dispatch {
            sender: &mut self.sender,
            listener: self.listener.as_deref_mut(),
            max_frame_len: self.max_frame_len,
            failure: None,
            closed: None,
        };
        let status = self.reader.on_readable(&mut dispatch);
        let Dispatch {
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

    /// Whether queued bytes are waiting for the producer fd to drain.
    pub fn wants_writable(&self) -> bool {
        self.sender.out.has_pending()
    }

    /// Whether the channel still accepts readable notifications.
    pub fn is_reading(&self) -> bool {
        self.close_reason.is_none() && self.reader.is_reading()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Stop reading without closing; pending writes are kept.
    pub fn stop_reading(&mut self) {
        self.reader.stop();
    }

    /// Close both directions and discard anything queued.
    pub fn close(&mut self) {
        self.reader.close();
        self.sender.out.close();
        if self.close_reason.is_none() {
            debug!("channel closed");
            self.close_reason = Some(ChannelCloseReason::Requested);
        }
    }

    pub fn close_reason(&self) -> Option<&ChannelCloseReason> {
        self.close_reason.as_ref()
    }

    /// Bytes read but not yet dispatched.
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    pub fn stats(&self) -> ChannelStats {
        self.sender.stats()
    }

    /// Consumer fd, for readiness registration.
    pub fn consumer_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    /// Producer fd, for readiness registration.
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
        reason.log("channel");
        let notify = reason.notifies_listener();
        self.close_reason = Some(reason);
        if notify {
            if let Some(listener) = self.listener.as_mut() {
                listener.on_closed();
            }
        }
    }
}

/// Splits the reader's window into frames and routes them to the listener.
struct Dispatch<'a> {
    sender: &'a mut ChannelSender,
    listener: Option<&'a mut (dyn ChannelListener + 'static)>,
    max_frame_len: usize,
    failure: Option<ChannelError>,
    closed: Option<CloseReason>,
}

impl Dispatch<'_> {
    fn dispatch(&mut self, body: &[u8]) -> Result<()> {
        match classify(body) {
            FrameKind::Json(json) => match parse_message(json)? {
                Some(Message::Request(request)) => {
                    self.sender.inbound.requests += 1;
                    debug!(id = request.id, method = %request.method, "request received");
                    let Some(listener) = self.listener.as_deref_mut() else {
                        warn!(id = request.id, "no listener for request");
                        return Ok(());
                    };
                    if let Err(err) = listener.on_request(self.sender, &request) {
                        warn!(id = request.id, method = %request.method, error = %err, "request handler failed");
                    }
                }
                Some(Message::Notification(notification)) => {
                    self.sender.inbound.notifications += 1;
                    debug!(event = %notification.event, "notification received");
                    let Some(listener) = self.listener.as_deref_mut() else {
                        return Ok(());
                    };
                    if let Err(err) = listener.on_notification(self.sender, &notification) {
                        warn!(event = %notification.event, error = %err, "notification handler failed");
                    }
                }
                None => self.sender.inbound.dropped += 1,
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
}

impl StreamConsumer for Dispatch<'_> {
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

            match decode_netstring(&data[offset..], self.max_frame_len)? {
                Decoded::Frame { body, consumed } => {
                    offset += consumed;
                    self.sender.inbound.frames += 1;
                    self.sender.inbound.bytes += consumed as u64;
                    trace!(len = body.len(), "frame received");
                    if let Err(err) = self.dispatch(body) {
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
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::listener::HandlerResult;
    use crate::message::Request;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Request(Request),
        Notification(Notification),
        Closed,
    }

    /// Records callbacks; replies to `worker.close` and closes on `stop`.
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Rc<RefCell<Vec<Seen>>>,
    }

    impl ChannelListener for Recorder {
        fn on_request(&mut self, sender: &mut ChannelSender, request: &Request) -> HandlerResult {
            self.seen.borrow_mut().push(Seen::Request(request.clone()));
            match request.method.as_str() {
                "worker.close" => {
                    sender.send(&request.accept())?;
                }
                "stop" => sender.close(),
                "fail" => return Err(crate::HandlerError::failed("boom")),
                _ => {}
            }
            Ok(())
        }

        fn on_notification(
            &mut self,
            _sender: &mut ChannelSender,
            notification: &Notification,
        ) -> HandlerResult {
            self.seen
                .borrow_mut()
                .push(Seen::Notification(notification.clone()));
            Ok(())
        }

        fn on_closed(&mut self) {
            self.seen.borrow_mut().push(Seen::Closed);
        }
    }

    /// Controller-side ends of a channel's two pipes.
    pub(crate) struct Peer {
        pub to_worker: UnixStream,
        pub from_worker: UnixStream,
        pub inbox: Vec<u8>,
    }

    impl Peer {
        pub fn send_frame(&mut self, body: &[u8]) {
            self.to_worker.write_all(&netstring(body)).unwrap();
        }

        /// Read exactly `n` frames from the worker.
        pub fn read_frames(&mut self, n: usize) -> Vec<Vec<u8>> {
            self.from_worker
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut frames = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                while frames.len() < n {
                    match decode_netstring(&self.inbox, usize::MAX).unwrap() {
                        Decoded::Frame { body, consumed } => {
                            frames.push(body.to_vec());
                            self.inbox.drain(..consumed);
                        }
                        Decoded::Incomplete { .. } => break,
                    }
                }
                if frames.len() == n {
                    return frames;
                }
                let read = self.from_worker.read(&mut chunk).unwrap();
                assert!(read > 0, "worker closed before {n} frames arrived");
                self.inbox.extend_from_slice(&chunk[..read]);
            }
        }

        /// Whether nothing is waiting to be read from the worker.
        pub fn nothing_pending(&mut self) -> bool {
            self.from_worker.set_nonblocking(true).unwrap();
            let mut byte = [0u8; 1];
            let result = self.from_worker.read(&mut byte);
            self.from_worker.set_nonblocking(false).unwrap();
            matches!(result, Err(ref e) if e.kind() == ErrorKind::WouldBlock)
        }
    }

    pub(crate) fn netstring(body: &[u8]) -> Vec<u8> {
        let mut wire = format!("{}:", body.len()).into_bytes();
        wire.extend_from_slice(body);
        wire.push(b',');
        wire
    }

    /// Two socket pairs standing in for the inherited pipes.
    pub(crate) fn pipes() -> (PipeEnd, PipeEnd, Peer) {
        let (to_worker, consumer) = UnixStream::pair().unwrap();
        let (producer, from_worker) = UnixStream::pair().unwrap();
        (
            PipeEnd::from(consumer),
            PipeEnd::from(producer),
            Peer {
                to_worker,
                from_worker,
                inbox: Vec::new(),
            },
        )
    }

    fn channel_with_recorder() -> (Channel, Peer, Rc<RefCell<Vec<Seen>>>) {
        let (consumer, producer, peer) = pipes();
        let mut channel = Channel::new(consumer, producer, ChannelConfig::default()).unwrap();
        let recorder = Recorder::default();
        let seen = Rc::clone(&recorder.seen);
        channel.set_listener(Box::new(recorder));
        (channel, peer, seen)
    }

    fn close_request(id: u32) -> Vec<u8> {
        format!(r#"{{"id":{id},"method":"worker.close","data":{{}}}}"#).into_bytes()
    }

    #[test]
    fn simple_request_response() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        let body = close_request(1);
        assert_eq!(netstring(&body), b"42:{\"id\":1,\"method\":\"worker.close\",\"data\":{}},");

        peer.send_frame(&body);
        assert_eq!(channel.on_readable(), ReadStatus::WouldBlock);

        assert_eq!(
            *seen.borrow(),
            vec![Seen::Request(Request {
                id: 1,
                method: "worker.close".to_string(),
                handler_id: None,
                data: json!({}),
            })]
        );

        drop(channel);
        let mut wire = Vec::new();
        peer.from_worker.read_to_end(&mut wire).unwrap();
        assert_eq!(wire, b"34:{\"id\":1,\"accepted\":true,\"data\":{}},");
    }

    #[test]
    fn split_delivery_dispatches_once() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        let wire = netstring(&close_request(1));

        let chunks: Vec<&[u8]> = wire.chunks(5).collect();
        assert_eq!(chunks.len(), 10);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(seen.borrow().is_empty(), "dispatched early at chunk {i}");
            peer.to_worker.write_all(chunk).unwrap();
            channel.on_readable();
        }

        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(channel.buffered(), 0);
        assert_eq!(peer.read_frames(1).len(), 1);
    }

    #[test]
    fn single_byte_delivery() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        let mut wire = netstring(br#"{"event":"a"}"#);
        wire.extend(netstring(br#"{"id":2,"method":"noop"}"#));
        wire.extend(netstring(br#"{"event":"b","data":{"x":1}}"#));

        for byte in &wire {
            peer.to_worker.write_all(std::slice::from_ref(byte)).unwrap();
            channel.on_readable();
        }

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], Seen::Notification(n) if n.event == "a"));
        assert!(matches!(&seen[1], Seen::Request(r) if r.id == 2));
        assert!(
            matches!(&seen[2], Seen::Notification(n) if n.data == Some(json!({"x": 1})))
        );
    }

    #[test]
    fn back_to_back_requests_in_one_chunk() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        let mut wire = netstring(br#"{"id":1,"method":"first"}"#);
        wire.extend(netstring(br#"{"id":2,"method":"second"}"#));
        peer.to_worker.write_all(&wire).unwrap();

        channel.on_readable();

        let methods: Vec<String> = seen
            .borrow()
            .iter()
            .map(|s| match s {
                Seen::Request(r) => r.method.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(methods, ["first", "second"]);
        assert_eq!(channel.buffered(), 0);
        assert_eq!(channel.stats().frames_received, 2);
        assert_eq!(channel.stats().requests, 2);
    }

    #[test]
    fn oversize_frame_closes_channel() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        peer.to_worker.write_all(b"99999999:").unwrap();

        assert_eq!(channel.on_readable(), ReadStatus::Closed);

        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        assert!(!channel.is_reading());
        assert!(matches!(
            channel.close_reason(),
            Some(ChannelCloseReason::ProtocolError(_))
        ));

        // Nothing else is read or dispatched afterwards.
        peer.send_frame(br#"{"event":"late"}"#);
        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn peer_close_notifies_listener_once() {
        let (mut channel, peer, seen) = channel_with_recorder();
        drop(peer.to_worker);

        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(channel.on_readable(), ReadStatus::Closed);

        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        assert_eq!(channel.close_reason(), Some(&ChannelCloseReason::PeerClosed));
    }

    #[test]
    fn invalid_json_is_protocol_error() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        peer.send_frame(b"{not-json");

        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        assert!(matches!(
            channel.close_reason(),
            Some(ChannelCloseReason::ProtocolError(_))
        ));
    }

    #[test]
    fn unknown_and_empty_frames_are_protocol_errors() {
        for body in [&b"[1,2,3]"[..], b""] {
            let (mut channel, mut peer, seen) = channel_with_recorder();
            peer.send_frame(body);

            assert_eq!(channel.on_readable(), ReadStatus::Closed);
            assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        }
    }

    #[test]
    fn malformed_netstring_is_protocol_error() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        peer.to_worker.write_all(b"3:abc;").unwrap();

        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
    }

    #[test]
    fn wrong_shape_and_peer_logs_are_dropped() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        peer.send_frame(br#"{"foo":1}"#);
        peer.send_frame(b"Wcontroller said something");
        peer.send_frame(br#"{"event":"still-here"}"#);

        assert_eq!(channel.on_readable(), ReadStatus::WouldBlock);

        assert_eq!(seen.borrow().len(), 1);
        let stats = channel.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.peer_logs, 1);
        assert_eq!(stats.notifications, 1);
        assert!(channel.is_reading());
    }

    #[test]
    fn handler_error_does_not_stop_dispatch() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        peer.send_frame(br#"{"id":1,"method":"fail"}"#);
        peer.send_frame(br#"{"id":2,"method":"after"}"#);

        channel.on_readable();

        assert_eq!(seen.borrow().len(), 2);
        assert!(channel.is_reading());
        // The channel never answers on the listener's behalf.
        assert!(peer.nothing_pending());
    }

    #[test]
    fn close_from_listener_stops_dispatch() {
        let (mut channel, mut peer, seen) = channel_with_recorder();
        peer.send_frame(br#"{"id":1,"method":"stop"}"#);
        peer.send_frame(br#"{"id":2,"method":"never"}"#);

        assert_eq!(channel.on_readable(), ReadStatus::Closed);

        assert_eq!(seen.borrow().len(), 1, "no dispatch after close, no on_closed");
        assert_eq!(channel.close_reason(), Some(&ChannelCloseReason::Requested));
    }

    #[test]
    fn sends_preserve_order() {
        let (mut channel, mut peer, _seen) = channel_with_recorder();

        for i in 0..100 {
            channel.notify("tick", None, Some(json!({ "n": i }))).unwrap();
        }

        let frames = peer.read_frames(100);
        for (i, frame) in frames.iter().enumerate() {
            let value: Value = serde_json::from_slice(frame).unwrap();
            assert_eq!(value["data"]["n"], json!(i));
        }
        assert_eq!(channel.stats().frames_sent, 100);
    }

    #[test]
    fn send_log_uses_sentinel() {
        let (mut channel, mut peer, _seen) = channel_with_recorder();

        channel.send_log(LogSeverity::Warn, "low disk").unwrap();
        channel.send_log(LogSeverity::Dump, "state").unwrap();

        assert_eq!(peer.read_frames(2), vec![b"Wlow disk".to_vec(), b"Xstate".to_vec()]);
    }

    #[test]
    fn queued_writes_drain_on_writable() {
        let (mut channel, peer, _seen) = channel_with_recorder();
        let big = "x".repeat(1024 * 1024);

        let status = channel.notify("big", None, Some(json!(big))).unwrap();
        assert_eq!(status, WriteStatus::Queued);
        assert!(channel.wants_writable());

        let reader = std::thread::spawn(move || {
            let mut peer = peer;
            peer.read_frames(1)
        });

        while channel.wants_writable() {
            if channel.on_writable() == WriteStatus::Queued {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let frames = reader.join().unwrap();
        let value: Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(value["data"].as_str().map(str::len), Some(1024 * 1024));
    }

    #[test]
    fn write_failure_closes_channel() {
        let (mut channel, peer, seen) = channel_with_recorder();
        drop(peer);

        assert!(channel.notify("lost", None, None).is_err());
        assert!(matches!(
            channel.close_reason(),
            Some(ChannelCloseReason::Io(_))
        ));
        assert_eq!(*seen.borrow(), vec![Seen::Closed]);
        // A worker that cannot reply stops reading as well.
        assert!(!channel.is_reading());
        assert_eq!(channel.on_readable(), ReadStatus::Closed);
        assert_eq!(
            channel.notify("dropped", None, None).unwrap(),
            WriteStatus::Dropped
        );
    }

    #[test]
    fn oversize_outbound_message_rejected() {
        let (consumer, producer, _peer) = pipes();
        let config = ChannelConfig {
            frame: FrameConfig {
                max_frame_len: 16,
                ..FrameConfig::channel()
            },
        };
        let mut channel = Channel::new(consumer, producer, config).unwrap();

        let err = channel
            .notify("this-event-name-is-long", None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Frame(FrameError::FrameTooLarge { .. })
        ));
        assert!(!channel.is_closed());
    }
}
