use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::trace;

use crate::error::{Result, TransportError};

/// One owned end of a pipe (or any stream descriptor) - implements Read + Write.
///
/// The descriptor is closed when the `PipeEnd` is dropped, and only then.
pub struct PipeEnd {
    file: File,
}

impl PipeEnd {
    /// Take ownership of an already-owned descriptor.
    pub fn from_owned(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    /// Adopt a raw descriptor after checking that it is open.
    ///
    /// # Safety
    ///
    /// `fd` must not be owned by anything else in this process; the returned
    /// `PipeEnd` closes it on drop.
    pub unsafe fn from_raw_checked(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(TransportError::InvalidDescriptor(fd));
        }

        // SAFETY: F_GETFD only inspects the descriptor table entry.
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if rc == -1 {
            return Err(TransportError::BadDescriptor {
                fd,
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: the descriptor is open and the caller hands us ownership.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_owned(owned))
    }

    /// Switch `O_NONBLOCK` on or off.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        update_flag(
            self.as_raw_fd(),
            libc::F_GETFL,
            libc::F_SETFL,
            libc::O_NONBLOCK,
            nonblocking,
        )?;
        trace!(fd = self.as_raw_fd(), nonblocking, "updated descriptor mode");
        Ok(())
    }

    /// Whether `O_NONBLOCK` is set.
    pub fn is_nonblocking(&self) -> Result<bool> {
        Ok(read_flags(self.as_raw_fd(), libc::F_GETFL)? & libc::O_NONBLOCK != 0)
    }

    /// Switch `FD_CLOEXEC` on or off.
    pub fn set_cloexec(&self, cloexec: bool) -> Result<()> {
        update_flag(
            self.as_raw_fd(),
            libc::F_GETFD,
            libc::F_SETFD,
            libc::FD_CLOEXEC,
            cloexec,
        )
    }

    /// Whether `FD_CLOEXEC` is set.
    pub fn is_cloexec(&self) -> Result<bool> {
        Ok(read_flags(self.as_raw_fd(), libc::F_GETFD)? & libc::FD_CLOEXEC != 0)
    }

    /// Consume the pipe end and return the owned descriptor.
    pub fn into_owned(self) -> OwnedFd {
        OwnedFd::from(self.file)
    }
}

/// Create an anonymous pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec; clear the flag on the end a child process
/// should inherit.
pub fn pipe() -> Result<(PipeEnd, PipeEnd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];

    // SAFETY: `fds` is a valid writable array of two c_ints.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(TransportError::Pipe(std::io::Error::last_os_error()));
    }

    // SAFETY: pipe(2) succeeded, so both descriptors are open and unowned.
    let (read_end, write_end) = unsafe {
        (
            PipeEnd::from_owned(OwnedFd::from_raw_fd(fds[0])),
            PipeEnd::from_owned(OwnedFd::from_raw_fd(fds[1])),
        )
    };
    read_end.set_cloexec(true)?;
    write_end.set_cloexec(true)?;

    Ok((read_end, write_end))
}

fn read_flags(fd: RawFd, get: libc::c_int) -> Result<libc::c_int> {
    // SAFETY: F_GETFL/F_GETFD take no extra argument and do not touch memory.
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(flags)
}

fn update_flag(
    fd: RawFd,
    get: libc::c_int,
    set: libc::c_int,
    flag: libc::c_int,
    enabled: bool,
) -> Result<()> {
    let flags = read_flags(fd, get)?;
    let updated = if enabled { flags | flag } else { flags & !flag };
    if updated == flags {
        return Ok(());
    }

    // SAFETY: F_SETFL/F_SETFD take an int argument and do not touch memory.
    let rc = unsafe { libc::fcntl(fd, set, updated) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl AsRawFd for PipeEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for PipeEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl From<OwnedFd> for PipeEnd {
    fn from(fd: OwnedFd) -> Self {
        Self::from_owned(fd)
    }
}

impl From<UnixStream> for PipeEnd {
    fn from(stream: UnixStream) -> Self {
        Self::from_owned(OwnedFd::from(stream))
    }
}

impl std::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::os::fd::IntoRawFd;

    use super::*;

    #[test]
    fn pipe_roundtrip() {
        let (mut reader, mut writer) = pipe().unwrap();

        writer.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();

        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn pipe_ends_are_cloexec() {
        let (reader, writer) = pipe().unwrap();
        assert!(reader.is_cloexec().unwrap());
        assert!(writer.is_cloexec().unwrap());

        reader.set_cloexec(false).unwrap();
        assert!(!reader.is_cloexec().unwrap());
    }

    #[test]
    fn nonblocking_read_would_block() {
        let (mut reader, _writer) = pipe().unwrap();
        reader.set_nonblocking(true).unwrap();
        assert!(reader.is_nonblocking().unwrap());

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn read_returns_zero_after_writer_dropped() {
        let (mut reader, writer) = pipe().unwrap();
        drop(writer);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_to_closed_pipe_fails() {
        let (reader, mut writer) = pipe().unwrap();
        drop(reader);

        let err = writer.write(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn from_unix_stream() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut left = PipeEnd::from(left);
        let mut right = PipeEnd::from(right);

        left.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn from_raw_checked_adopts_open_descriptor() {
        let (reader, _writer) = pipe().unwrap();
        let raw = reader.into_owned().into_raw_fd();

        // SAFETY: `raw` was just released from its owner above.
        let adopted = unsafe { PipeEnd::from_raw_checked(raw) }.unwrap();
        assert_eq!(adopted.as_raw_fd(), raw);
    }

    #[test]
    fn from_raw_checked_rejects_negative() {
        // SAFETY: the call fails before taking ownership of anything.
        let result = unsafe { PipeEnd::from_raw_checked(-1) };
        assert!(matches!(result, Err(TransportError::InvalidDescriptor(-1))));
    }

    #[test]
    fn from_raw_checked_rejects_closed_descriptor() {
        // SAFETY: the descriptor is not open, so the call fails before taking ownership.
        let result = unsafe { PipeEnd::from_raw_checked(1_000_000) };
        assert!(matches!(result, Err(TransportError::BadDescriptor { .. })));
    }
}
