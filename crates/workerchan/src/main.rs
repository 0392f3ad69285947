mod exit;
mod logging;
mod worker;

use std::fmt;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};
use workerchan_channel::{
    Channel, ChannelConfig, EventLoop, EventLoopConfig, PayloadChannel, PayloadChannelConfig,
};
use workerchan_frame::{FrameConfig, DEFAULT_MAX_FRAME_LEN};
use workerchan_transport::{FdLayout, InheritedFds};

use crate::exit::{channel_error, exit_code, transport_error, CliError, CliResult, SETTINGS};
use crate::logging::{
    init_logging, ChannelLogLayer, ForwardLevel, ForwardLevelHandle, LogFormat, LogLevel,
};
use crate::worker::{worker_router, PayloadHandler};

/// A `READ,WRITE` descriptor pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FdPair {
    read: RawFd,
    write: RawFd,
}

impl FromStr for FdPair {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (read, write) = value
            .split_once(',')
            .ok_or_else(|| format!("expected READ,WRITE descriptors, got '{value}'"))?;
        let parse = |fd: &str| {
            fd.trim()
                .parse::<RawFd>()
                .map_err(|_| format!("invalid descriptor '{fd}'"))
        };
        Ok(Self {
            read: parse(read)?,
            write: parse(write)?,
        })
    }
}

impl fmt::Display for FdPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.read, self.write)
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "workerchan",
    version,
    about = "Worker process speaking the controller channel protocol"
)]
struct Cli {
    /// Control channel descriptors (read,write).
    #[arg(
        long,
        value_name = "R,W",
        env = "WORKERCHAN_CHANNEL_FDS",
        default_value = "3,4"
    )]
    channel_fds: FdPair,

    /// Payload channel descriptors (read,write).
    #[arg(
        long,
        value_name = "R,W",
        env = "WORKERCHAN_PAYLOAD_CHANNEL_FDS",
        default_value = "5,6"
    )]
    payload_channel_fds: FdPair,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Minimum level of logs forwarded to the controller.
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    forward_log_level: ForwardLevel,

    /// Largest JSON message or payload accepted or sent, in bytes (at most 4 MiB).
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_FRAME_LEN, value_parser = parse_size)]
    max_message_size: usize,

    /// How long shutdown waits for queued messages to be written.
    #[arg(long, value_name = "DURATION", default_value = "200ms", value_parser = parse_duration)]
    drain_timeout: Duration,
}

impl Cli {
    fn fd_layout(&self) -> FdLayout {
        FdLayout {
            channel_consumer: self.channel_fds.read,
            channel_producer: self.channel_fds.write,
            payload_consumer: self.payload_channel_fds.read,
            payload_producer: self.payload_channel_fds.write,
        }
    }
}

fn parse_size(value: &str) -> Result<usize, String> {
    let size = value
        .parse::<usize>()
        .map_err(|_| format!("invalid size '{value}'"))?;
    if size == 0 {
        return Err("size must be greater than zero".to_string());
    }
    if size > DEFAULT_MAX_FRAME_LEN {
        return Err(format!(
            "size must be at most {DEFAULT_MAX_FRAME_LEN} bytes"
        ));
    }
    Ok(size)
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (number, unit) = if let Some(ms) = value.strip_suffix("ms") {
        (ms, "ms")
    } else if let Some(s) = value.strip_suffix('s') {
        (s, "s")
    } else {
        (value, "s")
    };

    let amount = number
        .parse::<u64>()
        .map_err(|_| format!("invalid duration '{value}'"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        _ => Duration::from_secs(amount),
    };
    Ok(duration)
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            std::process::exit(SETTINGS);
        }
        Err(err) => err.exit(),
    };

    let level = ForwardLevelHandle::new(cli.forward_log_level);
    let (forward, logs) = ChannelLogLayer::new(level.clone());
    init_logging(cli.log_format, cli.log_level, forward);

    match run(&cli, level, logs) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

fn run(
    cli: &Cli,
    level: ForwardLevelHandle,
    logs: tokio::sync::mpsc::UnboundedReceiver<workerchan_channel::LogRecord>,
) -> CliResult<i32> {
    let layout = cli.fd_layout();
    layout
        .validate()
        .map_err(|err| transport_error("invalid descriptor layout", err))?;

    // SAFETY: the controller spawns this process with these descriptors open
    // for the channels, and nothing else in the process has claimed them.
    let fds = unsafe { InheritedFds::adopt(layout) }
        .map_err(|err| transport_error("failed to adopt channel descriptors", err))?;

    let frame = FrameConfig {
        max_frame_len: cli.max_message_size,
        ..FrameConfig::channel()
    };
    let mut channel = Channel::new(
        fds.channel_consumer,
        fds.channel_producer,
        ChannelConfig { frame },
    )
    .map_err(|err| channel_error("failed to open channel", err))?;
    channel.set_listener(Box::new(worker_router(level)));

    let payload_config = PayloadChannelConfig {
        frame: FrameConfig {
            max_frame_len: cli.max_message_size,
            ..FrameConfig::payload_channel()
        },
        max_payload_len: cli.max_message_size,
        ..PayloadChannelConfig::default()
    };
    let mut payload_channel = PayloadChannel::new(
        fds.payload_consumer,
        fds.payload_producer,
        payload_config,
    )
    .map_err(|err| channel_error("failed to open payload channel", err))?;
    payload_channel.set_listener(Box::new(PayloadHandler));

    let pid = std::process::id().to_string();
    channel
        .notify("running", Some(pid.as_str()), None)
        .map_err(|err| channel_error("failed to announce worker", err))?;
    info!(pid = %pid, "worker running");

    let config = EventLoopConfig {
        drain_timeout: cli.drain_timeout,
        ..EventLoopConfig::default()
    };
    let reason = EventLoop::new(channel, payload_channel, config)
        .with_log_receiver(logs)
        .run()
        .map_err(|err| channel_error("event loop failed", err))?;

    debug!(?reason, "worker exiting");
    let code = exit_code(&reason);
    if code != exit::SUCCESS {
        return Err(CliError::new(code, format!("worker stopped: {reason:?}")));
    }
    Ok(code)
}
