//! Worker-side control channels over inherited Unix pipes.
//!
//! A worker process is spawned with two pipe pairs already open. workerchan
//! turns them into a JSON [`channel::Channel`] and a
//! [`channel::PayloadChannel`], frames every message as a netstring and
//! drives both from a single-threaded event loop.
//!
//! # Crate Structure
//!
//! - [`transport`]: Owned pipe ends and inherited descriptor adoption
//! - [`frame`]: Netstring codec, frame kinds, non-blocking reader and writer
//! - [`channel`]: Channels, listeners, routing and the event loop

/// Re-export transport types.
pub mod transport {
    pub use workerchan_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use workerchan_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use workerchan_channel::*;
}
