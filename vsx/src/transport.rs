//! Single-shot connections to a guest command server.
//!
//! A [`Connector`] opens one fresh stream per call. Streams are never pooled:
//! the caller owns the stream and dropping it closes the socket.
//!
//! [`VsockConnector`] talks `AF_VSOCK` directly (QEMU `vhost-vsock`).
//! [`UnixConnector`] connects to a Unix socket that the hypervisor maps to a
//! guest vsock port (libkrun, Firecracker).

#![allow(unsafe_code)]

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Address of a guest command server: context identifier and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct Endpoint {
    /// Guest context identifier.
    pub cid: u32,
    /// Port the guest command server listens on.
    pub port: u32,
}

impl Endpoint {
    /// Creates an endpoint for `cid:port`.
    pub const fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(vsx_proto::DEFAULT_CID, vsx_proto::AGENT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vsock CID={} PORT={}", self.cid, self.port)
    }
}

/// A connected, bidirectional byte stream to a guest.
pub trait Stream: Read + Write {
    /// Bounds how long a single `read` may block. `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Stream for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }
}

/// Opens connections to a guest [`Endpoint`].
pub trait Connector {
    /// The stream type produced on success.
    type Stream: Stream;

    /// Opens a new connection, giving up after roughly `timeout`.
    ///
    /// On failure no socket is left open.
    fn connect(&self, endpoint: Endpoint, timeout: Duration) -> io::Result<Self::Stream>;
}

impl<C: Connector + ?Sized> Connector for &C {
    type Stream = C::Stream;

    fn connect(&self, endpoint: Endpoint, timeout: Duration) -> io::Result<Self::Stream> {
        (**self).connect(endpoint, timeout)
    }
}

/// Converts a duration to a socket timeout; zero means "no timeout".
fn nonzero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Connects through a Unix socket mapped to the guest's vsock port.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    /// Host-side socket path.
    path: PathBuf,
}

impl UnixConnector {
    /// Creates a connector for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for UnixConnector {
    type Stream = UnixStream;

    fn connect(&self, endpoint: Endpoint, timeout: Duration) -> io::Result<UnixStream> {
        let stream = UnixStream::connect(&self.path).inspect_err(|e| {
            tracing::debug!(
                %endpoint,
                path = %self.path.display(),
                error = %e,
                "unix socket connect failed"
            );
        })?;
        stream.set_read_timeout(nonzero(timeout))?;
        stream.set_write_timeout(nonzero(timeout))?;
        Ok(stream)
    }
}

#[cfg(target_os = "linux")]
pub use vsock::{VsockConnector, VsockStream};

#[cfg(target_os = "linux")]
mod vsock {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::time::{Duration, Instant};

    use super::{Connector, Endpoint, Stream, nonzero};

    /// Minimum connect timeout. Shorter timeouts make non-blocking vsock
    /// connects fail spuriously with `EINPROGRESS`.
    pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Opens `AF_VSOCK` stream connections.
    #[derive(Debug, Clone, Copy)]
    pub struct VsockConnector {
        /// Floor applied to every requested timeout.
        min_timeout: Duration,
    }

    impl Default for VsockConnector {
        fn default() -> Self {
            Self::new(MIN_CONNECT_TIMEOUT)
        }
    }

    impl VsockConnector {
        /// Creates a connector that never waits less than `min_timeout`.
        pub const fn new(min_timeout: Duration) -> Self {
            Self { min_timeout }
        }

        /// The timeout actually used for a requested `timeout`.
        pub fn effective_timeout(&self, timeout: Duration) -> Duration {
            timeout.max(self.min_timeout)
        }
    }

    impl Connector for VsockConnector {
        type Stream = VsockStream;

        fn connect(&self, endpoint: Endpoint, timeout: Duration) -> io::Result<VsockStream> {
            let timeout = self.effective_timeout(timeout);
            tracing::debug!(
                cid = endpoint.cid,
                port = endpoint.port,
                timeout_ms = timeout.as_millis() as u64,
                "connecting"
            );
            connect(endpoint, timeout).inspect_err(|e| {
                tracing::debug!(
                    cid = endpoint.cid,
                    port = endpoint.port,
                    timeout_ms = timeout.as_millis() as u64,
                    error = %e,
                    "vsock connect failed"
                );
            })
        }
    }

    /// A connected `AF_VSOCK` stream. Dropping it closes the socket.
    #[derive(Debug)]
    pub struct VsockStream {
        /// The socket, read and written through `File`.
        file: File,
    }

    impl VsockStream {
        /// Bounds how long a single `write` may block.
        pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            set_timeout(self.file.as_raw_fd(), libc::SO_SNDTIMEO, timeout)
        }
    }

    impl Stream for VsockStream {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            set_timeout(self.file.as_raw_fd(), libc::SO_RCVTIMEO, timeout)
        }
    }

    impl Read for VsockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.file.read(buf)
        }
    }

    impl Write for VsockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.file.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    /// Creates a socket and connects it within `timeout`.
    ///
    /// The socket lives in an `OwnedFd` from the moment it exists, so every
    /// early return closes it.
    fn connect(endpoint: Endpoint, timeout: Duration) -> io::Result<VsockStream> {
        // SAFETY: socket(2) with constant arguments.
        let fd = unsafe {
            libc::socket(
                libc::AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and has no other owner.
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = endpoint.cid;
        addr.svm_port = endpoint.port;

        // SAFETY: addr is a fully initialised sockaddr_vm and the length matches.
        let ret = unsafe {
            libc::connect(
                sock.as_raw_fd(),
                std::ptr::from_ref(&addr).cast(),
                size_of::<libc::sockaddr_vm>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
            wait_writable(sock.as_raw_fd(), timeout)?;
            if let Some(err) = take_error(sock.as_raw_fd())? {
                return Err(err);
            }
        }

        set_blocking(sock.as_raw_fd())?;
        let stream = VsockStream {
            file: File::from(sock),
        };
        stream.set_read_timeout(nonzero(timeout))?;
        stream.set_write_timeout(nonzero(timeout))?;
        Ok(stream)
    }

    /// Polls `fd` for writability until `timeout` elapses.
    fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "vsock connect timed out",
                ));
            }
            let ms = libc::c_int::try_from(remaining.as_millis().max(1))
                .unwrap_or(libc::c_int::MAX);
            // SAFETY: pfd is a valid pollfd and nfds is 1.
            let ret = unsafe { libc::poll(&raw mut pfd, 1, ms) };
            if ret > 0 {
                return Ok(());
            }
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            // ret == 0 or EINTR: re-check the deadline.
        }
    }

    /// Reads and clears the pending socket error (`SO_ERROR`).
    fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: err and len are valid for writes of the advertised size.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::from_mut(&mut err).cast(),
                &raw mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
    }

    /// Clears `O_NONBLOCK` once the connect has completed.
    fn set_blocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl(F_GETFL/F_SETFL) on a valid descriptor.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sets `SO_RCVTIMEO` / `SO_SNDTIMEO`. `None` disables the timeout.
    fn set_timeout(fd: RawFd, opt: libc::c_int, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) => {
                let mut tv = libc::timeval {
                    tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
                    tv_usec: libc::suseconds_t::try_from(d.subsec_micros()).unwrap_or(0),
                };
                // A zeroed timeval means "block forever"; round tiny values up.
                if tv.tv_sec == 0 && tv.tv_usec == 0 {
                    tv.tv_usec = 1;
                }
                tv
            }
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        // SAFETY: tv is a valid timeval and the length matches.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::from_ref(&tv).cast(),
                size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use std::io::BufRead;
    use std::os::unix::net::UnixListener;

    use super::*;

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new(103, 5555).to_string(), "vsock CID=103 PORT=5555");
        assert_eq!(Endpoint::default(), Endpoint::new(103, 5555));
    }

    #[test]
    fn unix_connector_reaches_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            io::BufReader::new(stream).read_line(&mut line).unwrap();
            line
        });

        let connector = UnixConnector::new(&path);
        let mut stream = connector
            .connect(Endpoint::default(), Duration::from_secs(5))
            .unwrap();
        stream.write_all(b"ping\n").unwrap();
        drop(stream);

        assert_eq!(server.join().unwrap(), "ping\n");
    }

    #[test]
    fn unix_connector_fails_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let connector = UnixConnector::new(dir.path().join("missing.sock"));
        assert!(connector.connect(Endpoint::default(), Duration::ZERO).is_err());
    }
}
