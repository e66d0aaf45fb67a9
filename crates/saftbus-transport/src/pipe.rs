//! Unidirectional pipes used for out-of-band signal delivery.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::Result;

/// Create a pipe and return `(read_end, write_end)`.
///
/// Both ends are marked close-on-exec so they never leak into child processes.
#[cfg(unix)]
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];

    // SAFETY: `fds` is a valid two-element buffer for pipe(2) to fill.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }

    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by us.
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    set_cloexec(fds[0])?;
    set_cloexec(fds[1])?;

    Ok((read_end, write_end))
}

/// Put `fd` into non-blocking mode.
///
/// The daemon does this to its end of every signal pipe so a subscriber that
/// stops reading makes writes fail with `WouldBlock` instead of stalling.
#[cfg(unix)]
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: `fd` is borrowed, so it stays open for the duration of the call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above; only the O_NONBLOCK status flag is added.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(unix)]
fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: as above; only the FD_CLOEXEC bit is changed.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn pipe_carries_bytes_and_signals_eof() {
        let (read_end, write_end) = pipe().unwrap();
        let mut reader = File::from(read_end);
        let mut writer = File::from(write_end);

        writer.write_all(b"signal").unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"signal");
    }

    #[test]
    fn pipe_ends_are_cloexec() {
        let (read_end, write_end) = pipe().unwrap();
        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            // SAFETY: fd is open for the duration of the test.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[test]
    fn nonblocking_write_end_reports_would_block_when_full() {
        let (_read_end, write_end) = pipe().unwrap();
        set_nonblocking(write_end.as_fd()).unwrap();
        // SAFETY: fd is open for the duration of the test.
        let flags = unsafe { libc::fcntl(write_end.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);

        let mut writer = File::from(write_end);
        let chunk = [0u8; 4096];
        let err = loop {
            if let Err(err) = writer.write(&chunk) {
                break err;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
