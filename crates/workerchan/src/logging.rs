use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use clap::ValueEnum;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;
use workerchan_channel::{LogRecord, LogSeverity};

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> tracing::level_filters::LevelFilter {
        match self {
            LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
            LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
            LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
        }
    }
}

/// Lowest severity forwarded to the controller as log frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ForwardLevel {
    Debug,
    Warn,
    Error,
    #[value(name = "none")]
    Off,
}

impl ForwardLevel {
    /// Parse the names the controller uses in `worker.updateSettings`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "debug" => Some(ForwardLevel::Debug),
            "warn" => Some(ForwardLevel::Warn),
            "error" => Some(ForwardLevel::Error),
            "none" => Some(ForwardLevel::Off),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForwardLevel::Debug => "debug",
            ForwardLevel::Warn => "warn",
            ForwardLevel::Error => "error",
            ForwardLevel::Off => "none",
        }
    }

    pub fn allows(self, severity: LogSeverity) -> bool {
        match self {
            ForwardLevel::Debug => true,
            ForwardLevel::Warn => !matches!(severity, LogSeverity::Debug),
            ForwardLevel::Error => matches!(severity, LogSeverity::Error | LogSeverity::Dump),
            ForwardLevel::Off => false,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ForwardLevel::Debug => 0,
            ForwardLevel::Warn => 1,
            ForwardLevel::Error => 2,
            ForwardLevel::Off => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ForwardLevel::Debug,
            1 => ForwardLevel::Warn,
            2 => ForwardLevel::Error,
            _ => ForwardLevel::Off,
        }
    }
}

/// Shared, runtime-adjustable [`ForwardLevel`].
#[derive(Clone, Debug)]
pub struct ForwardLevelHandle(Arc<AtomicU8>);

impl ForwardLevelHandle {
    pub fn new(level: ForwardLevel) -> Self {
        Self(Arc::new(AtomicU8::new(level.to_u8())))
    }

    pub fn get(&self) -> ForwardLevel {
        ForwardLevel::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: ForwardLevel) {
        self.0.store(level.to_u8(), Ordering::Relaxed);
    }
}

// Events from the channel I/O paths would feed back into the channel.
const INTERNAL_TARGETS: &[&str] = &["workerchan_transport", "workerchan_frame", "workerchan_channel"];

fn is_internal_target(target: &str) -> bool {
    INTERNAL_TARGETS.iter().any(|prefix| target.starts_with(prefix))
}

fn severity_for(level: &Level) -> Option<LogSeverity> {
    match *level {
        Level::ERROR => Some(LogSeverity::Error),
        Level::WARN => Some(LogSeverity::Warn),
        Level::INFO | Level::DEBUG => Some(LogSeverity::Debug),
        _ => None,
    }
}

/// Tracing layer that hands worker log events to the event loop, which
/// writes them to the controller as log frames.
pub struct ChannelLogLayer {
    tx: UnboundedSender<LogRecord>,
    level: ForwardLevelHandle,
}

impl ChannelLogLayer {
    pub fn new(level: ForwardLevelHandle) -> (Self, UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, level }, rx)
    }
}

impl<S: Subscriber> Layer<S> for ChannelLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_internal_target(metadata.target()) {
            return;
        }
        let Some(severity) = severity_for(metadata.level()) else {
            return;
        };
        if !self.level.get().allows(severity) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        // The receiver is gone once the event loop has returned.
        let _ = self.tx.send(LogRecord {
            severity,
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Install the stderr formatter and the forwarding layer.
pub fn init_logging(format: LogFormat, level: LogLevel, forward: ChannelLogLayer) {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false);
    let registry = tracing_subscriber::registry().with(forward);

    match format {
        LogFormat::Text => {
            let _ = registry
                .with(stderr.with_filter(level.as_filter()))
                .try_init();
        }
        LogFormat::Json => {
            let _ = registry
                .with(stderr.json().with_filter(level.as_filter()))
                .try_init();
        }
    }
}
