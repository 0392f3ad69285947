//! Pipe descriptors for the worker control channels.
//!
//! The worker talks to its controller over anonymous pipes inherited at
//! spawn time. This is the lowest layer of workerchan: it owns those
//! descriptors, switches them to non-blocking mode and closes each of them
//! exactly once. Everything else builds on the [`PipeEnd`] type provided here.

pub mod error;

#[cfg(unix)]
pub mod fds;
#[cfg(unix)]
pub mod pipe;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use fds::{FdLayout, InheritedFds};
#[cfg(unix)]
pub use pipe::{pipe, PipeEnd};
