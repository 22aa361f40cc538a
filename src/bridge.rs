//! Socket I/O bridge
//!
//! The engine never touches the socket directly. It asks the bridge for
//! ciphertext bytes and hands it ciphertext bytes to deliver, and the
//! bridge translates each request into exactly one non-blocking syscall on
//! the bound descriptor, mapping the OS outcome onto a small status space.
//!
//! The [`ByteChannel`] trait is the seam: the production implementation is
//! [`SocketBridge`], bound to a raw descriptor once at session construction
//! and never mutated, but tests can substitute scripted channels.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;

/// Outcome of a single bridge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The full requested transfer completed.
    Ok,
    /// The transfer could not complete now; retry once the descriptor is
    /// ready. Partial data may have been transferred alongside this status.
    WouldBlock,
    /// The peer performed an orderly shutdown.
    ClosedGracefully,
    /// The peer reset the connection.
    ClosedAbort,
    /// Any other OS failure, carrying the errno.
    Failed(i32),
}

/// The two operations the engine drives against the socket.
///
/// Implementations must never block beyond the single underlying syscall;
/// flow control belongs to the engine's retry loop, not to the channel.
pub trait ByteChannel {
    /// The engine wants ciphertext: read at most `buf.len()` bytes.
    fn wants_read(&mut self, buf: &mut [u8]) -> (usize, IoStatus);

    /// The engine produced ciphertext: write out of `buf`.
    fn wants_write(&mut self, buf: &[u8]) -> (usize, IoStatus);
}

/// Bridge over a raw socket descriptor.
///
/// Holds the descriptor by value only; the socket's lifecycle stays with
/// the caller. Closing the descriptor out from under a stalled session is
/// the supported cancellation path and surfaces as `ClosedAbort` or
/// `Failed` on the next operation.
#[derive(Debug)]
pub struct SocketBridge {
    fd: RawFd,
}

impl SocketBridge {
    pub fn new(fd: RawFd) -> Self {
        SocketBridge { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn map_errno(errno: i32, reading: bool) -> IoStatus {
        if reading && errno == libc::ENOENT {
            return IoStatus::ClosedGracefully;
        }
        match errno {
            libc::EAGAIN => IoStatus::WouldBlock,
            #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on Linux
            libc::EWOULDBLOCK => IoStatus::WouldBlock,
            libc::ECONNRESET if reading => IoStatus::ClosedAbort,
            other => IoStatus::Failed(other),
        }
    }
}

impl ByteChannel for SocketBridge {
    fn wants_read(&mut self, buf: &mut [u8]) -> (usize, IoStatus) {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            let n = n as usize;
            let status = if n == buf.len() {
                IoStatus::Ok
            } else {
                // Partial data: deliver what arrived and signal the engine
                // to come back for the remainder.
                IoStatus::WouldBlock
            };
            log::trace!("bridge read {}/{} bytes on fd {}", n, buf.len(), self.fd);
            return (n, status);
        }
        if n == 0 {
            return (0, IoStatus::ClosedGracefully);
        }
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        (0, Self::map_errno(errno, true))
    }

    fn wants_write(&mut self, buf: &[u8]) -> (usize, IoStatus) {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n > 0 {
            let n = n as usize;
            let status = if n == buf.len() {
                IoStatus::Ok
            } else {
                IoStatus::WouldBlock
            };
            log::trace!("bridge wrote {}/{} bytes on fd {}", n, buf.len(), self.fd);
            return (n, status);
        }
        if n == 0 {
            return (0, IoStatus::ClosedGracefully);
        }
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        (0, Self::map_errno(errno, false))
    }
}

/// Adapter presenting a [`ByteChannel`] to the engine as a byte stream.
///
/// Statuses translate to the stream vocabulary the engines consume:
/// would-block with no data becomes `ErrorKind::WouldBlock`, orderly
/// shutdown becomes a zero-length read, an abort becomes
/// `ErrorKind::ConnectionReset`. Partial transfers are surfaced as
/// short reads/writes, which every engine already retries.
pub struct BridgeIo<C> {
    channel: C,
}

impl<C: ByteChannel> BridgeIo<C> {
    pub fn new(channel: C) -> Self {
        BridgeIo { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

impl<C: ByteChannel> Read for BridgeIo<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.channel.wants_read(buf) {
            (n, IoStatus::Ok) => Ok(n),
            (n, IoStatus::WouldBlock) if n > 0 => Ok(n),
            (_, IoStatus::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            (_, IoStatus::ClosedGracefully) => Ok(0),
            (_, IoStatus::ClosedAbort) => Err(io::ErrorKind::ConnectionReset.into()),
            (_, IoStatus::Failed(errno)) => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

impl<C: ByteChannel> Write for BridgeIo<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.channel.wants_write(buf) {
            (n, IoStatus::Ok) => Ok(n),
            (n, IoStatus::WouldBlock) if n > 0 => Ok(n),
            (_, IoStatus::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            (_, IoStatus::ClosedGracefully) => Ok(0),
            (_, IoStatus::ClosedAbort) => Err(io::ErrorKind::ConnectionReset.into()),
            (_, IoStatus::Failed(errno)) => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
