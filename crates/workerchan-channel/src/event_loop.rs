//! Single-threaded driver for a [`Channel`] and a [`PayloadChannel`].

use std::os::fd::RawFd;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use workerchan_frame::{LogSeverity, ReadStatus, WriteStatus};

use crate::channel::{Channel, ChannelCloseReason};
use crate::error::Result;
use crate::payload_channel::PayloadChannel;

/// Default bound on flushing queued writes at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Event loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// How long shutdown waits for queued writes to reach the peer.
    pub drain_timeout: Duration,
    /// Stop on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            handle_signals: true,
        }
    }
}

/// A log line to forward to the controller over the [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub severity: LogSeverity,
    pub message: String,
}

/// Why the event loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The controller closed a channel.
    PeerClosed,
    /// A listener or the owner asked to close.
    Requested,
    /// SIGINT or SIGTERM.
    Signal,
    /// The controller broke the wire protocol.
    ProtocolError(String),
    /// Reading or writing a channel failed.
    IoError(String),
}

impl From<&ChannelCloseReason> for ExitReason {
    fn from(reason: &ChannelCloseReason) -> Self {
        match reason {
            ChannelCloseReason::PeerClosed => ExitReason::PeerClosed,
            ChannelCloseReason::Requested => ExitReason::Requested,
            ChannelCloseReason::ProtocolError(message) => ExitReason::ProtocolError(message.clone()),
            ChannelCloseReason::Io(message) => ExitReason::IoError(message.clone()),
        }
    }
}

struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }
}

/// Owns both channels and services their fds until one of them closes.
pub struct EventLoop {
    channel: Channel,
    payload_channel: PayloadChannel,
    logs: Option<UnboundedReceiver<LogRecord>>,
    config: EventLoopConfig,
}

impl EventLoop {
    pub fn new(channel: Channel, payload_channel: PayloadChannel, config: EventLoopConfig) -> Self {
        Self {
            channel,
            payload_channel,
            logs: None,
            config,
        }
    }

    /// Forward records from `logs` to the controller as log frames.
    pub fn with_log_receiver(mut self, logs: UnboundedReceiver<LogRecord>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn payload_channel_mut(&mut self) -> &mut PayloadChannel {
        &mut self.payload_channel
    }

    /// Run on a new current-thread runtime until a channel closes or a
    /// signal arrives.
    pub fn run(self) -> Result<ExitReason> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run_async())
    }

    /// Run on the current runtime, which must have I/O and time enabled.
    pub async fn run_async(mut self) -> Result<ExitReason> {
        let channel_in = AsyncFd::with_interest(self.channel.consumer_fd(), Interest::READABLE)?;
        let channel_out = AsyncFd::with_interest(self.channel.producer_fd(), Interest::WRITABLE)?;
        let payload_in =
            AsyncFd::with_interest(self.payload_channel.consumer_fd(), Interest::READABLE)?;
        let payload_out =
            AsyncFd::with_interest(self.payload_channel.producer_fd(), Interest::WRITABLE)?;
        let mut signals = if self.config.handle_signals {
            Some(Signals::install()?)
        } else {
            None
        };
        let mut logs = self.logs.take();

        debug!("event loop running");
        let reason = loop {
            if let Some(reason) = self.exit_reason() {
                break reason;
            }

            let channel_reading = self.channel.is_reading();
            let payload_reading = self.payload_channel.is_reading();
            let channel_writing = self.channel.wants_writable();
            let payload_writing = self.payload_channel.wants_writable();

            tokio::select! {
                guard = channel_in.readable(), if channel_reading => {
                    let mut guard = guard?;
                    if self.channel.on_readable() == ReadStatus::WouldBlock {
                        guard.clear_ready();
                    }
                }
                guard = payload_in.readable(), if payload_reading => {
                    let mut guard = guard?;
                    if self.payload_channel.on_readable() == ReadStatus::WouldBlock {
                        guard.clear_ready();
                    }
                }
                guard = channel_out.writable(), if channel_writing => {
                    let mut guard = guard?;
                    if self.channel.on_writable() == WriteStatus::Queued {
                        guard.clear_ready();
                    }
                }
                guard = payload_out.writable(), if payload_writing => {
                    let mut guard = guard?;
                    if self.payload_channel.on_writable() == WriteStatus::Queued {
                        guard.clear_ready();
                    }
                }
                record = recv_log(&mut logs) => match record {
                    Some(record) => {
                        if let Err(err) = self.channel.send_log(record.severity, &record.message) {
                            debug!(error = %err, "dropping forwarded log record");
                        }
                    }
                    None => logs = None,
                },
                name = recv_signal(&mut signals) => {
                    info!(signal = name, "shutting down on signal");
                    break ExitReason::Signal;
                }
            }
        };

        debug!(?reason, "event loop stopping");
        self.channel.stop_reading();
        self.payload_channel.stop_reading();
        self.drain(&channel_out, &payload_out).await;
        self.channel.close();
        self.payload_channel.close();

        drop((channel_in, channel_out, payload_in, payload_out));
        Ok(reason)
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        self.channel
            .close_reason()
            .or(self.payload_channel.close_reason())
            .map(ExitReason::from)
    }

    /// Flush queued writes, giving up after the drain timeout.
    async fn drain(&mut self, channel_out: &AsyncFd<RawFd>, payload_out: &AsyncFd<RawFd>) {
        if !self.channel.wants_writable() && !self.payload_channel.wants_writable() {
            return;
        }

        let timeout = self.config.drain_timeout;
        let flushed = tokio::time::timeout(timeout, async {
            loop {
                let channel_writing = self.channel.wants_writable();
                let payload_writing = self.payload_channel.wants_writable();

                tokio::select! {
                    guard = channel_out.writable(), if channel_writing => {
                        let Ok(mut guard) = guard else { break };
                        if self.channel.on_writable() == WriteStatus::Queued {
                            guard.clear_ready();
                        }
                    }
                    guard = payload_out.writable(), if payload_writing => {
                        let Ok(mut guard) = guard else { break };
                        if self.payload_channel.on_writable() == WriteStatus::Queued {
                            guard.clear_ready();
                        }
                    }
                    else => break,
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!(?timeout, "discarding unsent messages after drain timeout");
        }
    }
}

async fn recv_log(logs: &mut Option<UnboundedReceiver<LogRecord>>) -> Option<LogRecord> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_signal(signals: &mut Option<Signals>) -> &'static str {
    match signals {
        Some(signals) => tokio::select! {
            _ = signals.interrupt.recv() => "SIGINT",
            _ = signals.terminate.recv() => "SIGTERM",
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::channel::tests::{netstring, pipes, Peer};
    use crate::channel::ChannelConfig;
    use crate::payload_channel::PayloadChannelConfig;
    use crate::router::Router;

    fn test_config() -> EventLoopConfig {
        EventLoopConfig {
            handle_signals: false,
            ..EventLoopConfig::default()
        }
    }

    fn event_loop(router: Router) -> (EventLoop, Peer, Peer) {
        let (consumer, producer, channel_peer) = pipes();
        let mut channel = Channel::new(consumer, producer, ChannelConfig::default()).unwrap();
        channel.set_listener(Box::new(router));

        let (consumer, producer, payload_peer) = pipes();
        let payload_channel =
            PayloadChannel::new(consumer, producer, PayloadChannelConfig::default()).unwrap();

        (
            EventLoop::new(channel, payload_channel, test_config()),
            channel_peer,
            payload_peer,
        )
    }

    fn closing_router() -> Router {
        Router::new().method("worker.close", |sender, _request| {
            sender.close();
            Ok(json!({}))
        })
    }

    #[test]
    fn close_request_flushes_response() {
        let (event_loop, mut peer, _payload_peer) = event_loop(closing_router());

        let controller = thread::spawn(move || {
            peer.send_frame(br#"{"id":1,"method":"worker.close","data":{}}"#);
            peer.read_frames(1)
        });

        assert_eq!(event_loop.run().unwrap(), ExitReason::Requested);
        let frames = controller.join().unwrap();
        assert_eq!(frames[0], br#"{"id":1,"accepted":true,"data":{}}"#);
    }

    #[test]
    fn peer_close_ends_loop() {
        let (event_loop, peer, _payload_peer) = event_loop(Router::new());
        drop(peer);

        assert_eq!(event_loop.run().unwrap(), ExitReason::PeerClosed);
    }

    #[test]
    fn payload_peer_close_ends_loop() {
        let (event_loop, _peer, payload_peer) = event_loop(Router::new());
        drop(payload_peer);

        assert_eq!(event_loop.run().unwrap(), ExitReason::PeerClosed);
    }

    #[test]
    fn protocol_error_ends_loop() {
        let (event_loop, mut peer, _payload_peer) = event_loop(Router::new());
        peer.to_worker.write_all(b"99999999:").unwrap();

        assert!(matches!(
            event_loop.run().unwrap(),
            ExitReason::ProtocolError(_)
        ));
    }

    #[test]
    fn forwards_log_records() {
        let (event_loop, mut peer, _payload_peer) = event_loop(Router::new());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(LogRecord {
            severity: LogSeverity::Debug,
            message: "hello".to_string(),
        })
        .unwrap();
        drop(tx);
        let event_loop = event_loop.with_log_receiver(rx);

        let controller = thread::spawn(move || {
            let frames = peer.read_frames(1);
            drop(peer.to_worker);
            frames
        });

        assert_eq!(event_loop.run().unwrap(), ExitReason::PeerClosed);
        assert_eq!(controller.join().unwrap(), vec![b"Dhello".to_vec()]);
    }

    #[test]
    fn queued_writes_drain_through_readiness() {
        let (mut event_loop, mut peer, _payload_peer) = event_loop(closing_router());
        let big = "y".repeat(2 * 1024 * 1024);
        let status = event_loop
            .channel_mut()
            .notify("big", None, Some(json!(big)))
            .unwrap();
        assert_eq!(status, WriteStatus::Queued);

        let controller = thread::spawn(move || {
            let frames = peer.read_frames(1);
            peer.to_worker
                .write_all(&netstring(br#"{"id":5,"method":"worker.close"}"#))
                .unwrap();
            let reply = peer.read_frames(1);
            (frames, reply)
        });

        assert_eq!(event_loop.run().unwrap(), ExitReason::Requested);
        let (frames, reply) = controller.join().unwrap();
        assert_eq!(frames[0].len(), big_len());
        assert_eq!(reply[0], br#"{"id":5,"accepted":true,"data":{}}"#);

        fn big_len() -> usize {
            br#"{"event":"big","data":""}"#.len() + 2 * 1024 * 1024
        }
    }
}
