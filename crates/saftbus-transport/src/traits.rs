use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::error::Result;

/// Most descriptors accepted alongside a single message.
const MAX_FDS_PER_MESSAGE: usize = 4;

/// A connected saftbus stream: implements `Read` + `Write` and carries file
/// descriptors as `SCM_RIGHTS` ancillary data.
///
/// Every read goes through `recvmsg(2)`, so descriptors attached by the peer
/// are never silently dropped; they are queued and handed out with
/// [`IpcStream::take_received_fd`].
pub struct IpcStream {
    inner: IpcStreamInner,
    received_fds: VecDeque<OwnedFd>,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                recv_with_fds(stream.as_raw_fd(), buf, &mut self.received_fds)
            }
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
            received_fds: VecDeque::new(),
        }
    }

    /// Create a connected pair of streams (socketpair).
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    ///
    /// The clone starts with an empty descriptor queue.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_unix(cloned))
            }
        }
    }

    /// Shut down both directions of the stream.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream
                .shutdown(std::net::Shutdown::Both)
                .map_err(Into::into),
        }
    }

    /// Send `buf` with `fds` attached. Returns the number of bytes written,
    /// which may be less than `buf.len()`; the descriptors travel with the
    /// first byte.
    #[cfg(unix)]
    pub fn send_with_fds(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => send_with_fds(stream.as_raw_fd(), buf, fds),
        }
    }

    /// Pop the oldest descriptor received from the peer.
    pub fn take_received_fd(&mut self) -> Option<OwnedFd> {
        self.received_fds.pop_front()
    }

    /// Number of received descriptors not yet taken.
    pub fn pending_fds(&self) -> usize {
        self.received_fds.len()
    }

    /// Close every queued descriptor.
    pub fn discard_received_fds(&mut self) {
        self.received_fds.clear();
    }

    /// Get the credentials of the connected peer (Linux only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        let fd = match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

#[cfg(unix)]
impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

#[cfg(unix)]
impl AsFd for IpcStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_fd(),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => f
                .debug_struct("IpcStream")
                .field("fd", &stream.as_raw_fd())
                .field("pending_fds", &self.received_fds.len())
                .finish(),
        }
    }
}

/// Control buffer large enough for `MAX_FDS_PER_MESSAGE` descriptors,
/// aligned for `cmsghdr`.
#[cfg(unix)]
type ControlBuf = [u64; 8];

#[cfg(unix)]
fn cmsg_space(fd_count: usize) -> usize {
    // SAFETY: CMSG_SPACE only computes a size.
    unsafe { libc::CMSG_SPACE((fd_count * std::mem::size_of::<RawFd>()) as u32) as usize }
}

#[cfg(unix)]
fn recv_with_fds(fd: RawFd, buf: &mut [u8], out: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control: ControlBuf = [0; 8];
    let space = cmsg_space(MAX_FDS_PER_MESSAGE).min(std::mem::size_of::<ControlBuf>());

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = space as _;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::recvmsg(fd, &mut msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    for raw in parse_fds(&msghdr) {
        // SAFETY: descriptors delivered via SCM_RIGHTS are owned by the receiver.
        out.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
    }

    if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor control message truncated",
        ));
    }

    Ok(n as usize)
}

#[cfg(unix)]
fn parse_fds(msghdr: &libc::msghdr) -> Vec<RawFd> {
    let mut out = Vec::new();
    // SAFETY: msghdr points at a valid control buffer owned by the caller.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                if cmsg_len >= base_len + std::mem::size_of::<RawFd>() {
                    let count = (cmsg_len - base_len) / std::mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..count {
                        out.push(std::ptr::read_unaligned(data.add(i)));
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}

#[cfg(unix)]
fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("at most {MAX_FDS_PER_MESSAGE} descriptors per message"),
        ));
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut control: ControlBuf = [0; 8];

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;

    if !fds.is_empty() {
        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let data_len = raw.len() * std::mem::size_of::<RawFd>();
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = cmsg_space(raw.len()) as _;

        // SAFETY: control buffer is sized with CMSG_SPACE and owned here.
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "failed to allocate SCM_RIGHTS cmsg",
            ));
        }

        // SAFETY: cmsg points into `control` and `raw` has `raw.len()` entries.
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw.len(),
            );
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::sendmsg(fd, &msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
