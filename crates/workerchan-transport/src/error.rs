use std::os::fd::RawFd;

/// Errors that can occur while adopting or configuring pipe descriptors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The descriptor number is not usable (negative).
    #[error("invalid descriptor number {0}")]
    InvalidDescriptor(RawFd),

    /// The descriptor is not open in this process.
    #[error("descriptor {fd} is not open: {source}")]
    BadDescriptor { fd: RawFd, source: std::io::Error },

    /// The same descriptor was listed for more than one channel end.
    #[error("descriptor {0} listed more than once")]
    DuplicateDescriptor(RawFd),

    /// Creating an anonymous pipe failed.
    #[error("failed to create pipe: {0}")]
    Pipe(std::io::Error),

    /// An I/O error occurred while configuring a descriptor.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
