use std::os::fd::RawFd;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::pipe::PipeEnd;

/// Descriptor numbers of the four inherited channel pipe ends.
///
/// Consumer ends are read by the worker (controller → worker); producer ends
/// are written by the worker (worker → controller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdLayout {
    pub channel_consumer: RawFd,
    pub channel_producer: RawFd,
    pub payload_consumer: RawFd,
    pub payload_producer: RawFd,
}

impl Default for FdLayout {
    fn default() -> Self {
        Self {
            channel_consumer: 3,
            channel_producer: 4,
            payload_consumer: 5,
            payload_producer: 6,
        }
    }
}

impl FdLayout {
    fn as_array(&self) -> [RawFd; 4] {
        [
            self.channel_consumer,
            self.channel_producer,
            self.payload_consumer,
            self.payload_producer,
        ]
    }

    /// Reject negative and repeated descriptor numbers.
    pub fn validate(&self) -> Result<()> {
        let fds = self.as_array();
        for (idx, fd) in fds.iter().enumerate() {
            if *fd < 0 {
                return Err(TransportError::InvalidDescriptor(*fd));
            }
            if fds[..idx].contains(fd) {
                return Err(TransportError::DuplicateDescriptor(*fd));
            }
        }
        Ok(())
    }
}

/// The four channel pipe ends adopted from the parent process.
#[derive(Debug)]
pub struct InheritedFds {
    pub channel_consumer: PipeEnd,
    pub channel_producer: PipeEnd,
    pub payload_consumer: PipeEnd,
    pub payload_producer: PipeEnd,
}

impl InheritedFds {
    /// Adopt the descriptors named by `layout`.
    ///
    /// Every descriptor is checked to be open, then set non-blocking and
    /// close-on-exec so it does not leak into processes the worker spawns.
    ///
    /// # Safety
    ///
    /// The descriptors must have been inherited for this purpose and must not
    /// be owned by anything else in the process.
    pub unsafe fn adopt(layout: FdLayout) -> Result<Self> {
        layout.validate()?;

        // SAFETY: forwarded from the caller's contract.
        let fds = unsafe {
            Self {
                channel_consumer: adopt_one(layout.channel_consumer)?,
                channel_producer: adopt_one(layout.channel_producer)?,
                payload_consumer: adopt_one(layout.payload_consumer)?,
                payload_producer: adopt_one(layout.payload_producer)?,
            }
        };

        debug!(?layout, "adopted inherited channel descriptors");
        Ok(fds)
    }
}

unsafe fn adopt_one(fd: RawFd) -> Result<PipeEnd> {
    // SAFETY: forwarded from `InheritedFds::adopt`.
    let end = unsafe { PipeEnd::from_raw_checked(fd)? };
    end.set_nonblocking(true)?;
    end.set_cloexec(true)?;
    Ok(end)
}
