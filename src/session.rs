//! TLS session
//!
//! A session binds one engine context to one connected socket descriptor
//! and walks the lifecycle `Created → ContextReady → Handshaking →
//! Established → Closed`, with `Failed` terminal from the two middle
//! states.
//!
//! `handshake`, `send` and `recv` are synchronous with internal retry: the
//! engine may need several bridge round-trips to move one record, and the
//! session loops on its behalf, waiting for descriptor readiness with
//! `poll(2)` instead of spinning. Would-block never reaches the caller; a
//! zero-byte `recv` means orderly peer shutdown, an error means the
//! session is dead.
//!
//! One session is driven by one thread; there is no internal locking and
//! no reentrancy guarantee. A stalled session is cancelled by closing the
//! underlying descriptor, which surfaces as an abort on the next
//! operation.

use std::fmt;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::cert::CertInfo;
use crate::engine::{Engine, Negotiated, Step, Want};
use crate::error::EngineError;

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn is_server(self) -> bool {
        self == Role::Server
    }
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    ContextReady,
    Handshaking,
    Established,
    Closed,
    Failed,
}

/// A TLS session bound to one socket descriptor.
///
/// The descriptor is held by value only; the socket's lifecycle belongs to
/// the caller and must outlive the session's use of it.
pub struct Session<E: Engine> {
    role: Role,
    fd: RawFd,
    engine: Option<E>,
    phase: Phase,
    self_signed: bool,
    timeout: Option<Duration>,
}

impl<E: Engine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("fd", &self.fd)
            .field("engine", &self.engine.is_some())
            .field("phase", &self.phase)
            .field("self_signed", &self.self_signed)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<E: Engine> Session<E> {
    pub fn new(role: Role, fd: RawFd, self_signed: bool) -> Self {
        Session {
            role,
            fd,
            engine: None,
            phase: Phase::Created,
            self_signed,
            timeout: None,
        }
    }

    /// Attach the engine context. `Created → ContextReady`.
    pub fn bind_engine(&mut self, engine: E) -> Result<(), EngineError> {
        if self.phase != Phase::Created {
            return Err(EngineError::param("engine already bound"));
        }
        self.engine = Some(engine);
        self.phase = Phase::ContextReady;
        Ok(())
    }

    /// Deadline applied to each of `handshake`, `send` and `recv`.
    /// `None` (the default) retries indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Drive the handshake to completion. `ContextReady → Established`,
    /// or `Failed` with the mapped engine error.
    pub fn handshake(&mut self) -> Result<(), EngineError> {
        if self.phase != Phase::ContextReady {
            return Err(EngineError::param("handshake requires a fresh context"));
        }
        self.phase = Phase::Handshaking;
        let started = Instant::now();
        loop {
            let Some(engine) = self.engine.as_mut() else {
                self.phase = Phase::Failed;
                return Err(EngineError::param("session has no engine context"));
            };
            match engine.handshake_step() {
                Ok(Step::Done(())) => {
                    self.phase = Phase::Established;
                    if let Some(negotiated) = self.negotiated() {
                        log::debug!(
                            "handshake complete on fd {}: {} {}",
                            self.fd,
                            negotiated.version,
                            negotiated.cipher
                        );
                    }
                    return Ok(());
                }
                Ok(Step::Retry(want)) => {
                    if let Err(e) = wait_ready(self.fd, want, remaining(self.timeout, started)) {
                        self.phase = Phase::Failed;
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.phase = Phase::Failed;
                    log::warn!("handshake failed on fd {}: {}", self.fd, e);
                    return Err(e);
                }
            }
        }
    }

    /// Encrypt and send out of `buf`, returning the number of plaintext
    /// bytes consumed. Retries internally on would-block.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        loop {
            let Some(engine) = self.engine.as_mut() else {
                self.phase = Phase::Failed;
                return Err(EngineError::param("session has no engine context"));
            };
            match engine.write_step(buf) {
                Ok(Step::Done(n)) => return Ok(n),
                Ok(Step::Retry(want)) => {
                    if let Err(e) = wait_ready(self.fd, want, remaining(self.timeout, started)) {
                        self.phase = Phase::Failed;
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.phase = Phase::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Receive and decrypt into `buf`. `Ok(0)` exactly when the peer
    /// performed an orderly shutdown. Retries internally on would-block.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        loop {
            let Some(engine) = self.engine.as_mut() else {
                self.phase = Phase::Failed;
                return Err(EngineError::param("session has no engine context"));
            };
            match engine.read_step(buf) {
                Ok(Step::Done(n)) => return Ok(n),
                Ok(Step::Retry(want)) => {
                    if let Err(e) = wait_ready(self.fd, want, remaining(self.timeout, started)) {
                        self.phase = Phase::Failed;
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.phase = Phase::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Close the session: notify the peer (best effort) and release the
    /// engine context. Idempotent; closing a closed session is a no-op.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if let Some(mut engine) = self.engine.take() {
            let _ = engine.shutdown();
        }
        self.phase = Phase::Closed;
        Ok(())
    }

    /// Re-check the peer's authentication.
    ///
    /// For a self-signed server session this is a deliberate no-op: trust
    /// was established solely by presenting the configured identity, and
    /// there is no peer material to re-check.
    pub fn verify_connection(&self) -> Result<(), EngineError> {
        if self.self_signed && self.role.is_server() {
            return Ok(());
        }
        self.engine
            .as_ref()
            .ok_or_else(|| EngineError::param("session has no engine context"))?
            .peer_verified()
    }

    /// The peer's leaf certificate, when one was presented.
    pub fn peer_certificate(&self) -> Option<CertInfo> {
        self.engine.as_ref().and_then(|e| e.peer_certificate())
    }

    /// Negotiated protocol version and cipher, once established.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.engine.as_ref().and_then(|e| e.negotiated())
    }

    fn ensure_established(&self) -> Result<(), EngineError> {
        if self.phase != Phase::Established {
            return Err(EngineError::param("session is not established"));
        }
        Ok(())
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Time left of an optional per-operation deadline.
fn remaining(timeout: Option<Duration>, started: Instant) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(started.elapsed()))
}

/// Wait for the descriptor to become ready for `want`, bounded by
/// `timeout`. A `None` timeout waits indefinitely.
fn wait_ready(fd: RawFd, want: Want, timeout: Option<Duration>) -> Result<(), EngineError> {
    if timeout == Some(Duration::ZERO) {
        return Err(EngineError::TimedOut);
    }

    let mut pfd = libc::pollfd {
        fd,
        events: match want {
            Want::Read => libc::POLLIN,
            Want::Write => libc::POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    let result = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(EngineError::from_io(&std::io::Error::last_os_error()));
    }
    if result == 0 {
        return Err(EngineError::TimedOut);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    /// Scripted engine: a fixed number of retries before each operation
    /// completes, with call counting.
    struct FakeEngine {
        retries_left: usize,
        handshake_calls: usize,
        fail_with: Option<EngineError>,
    }

    impl FakeEngine {
        fn retrying(n: usize) -> Self {
            FakeEngine {
                retries_left: n,
                handshake_calls: 0,
                fail_with: None,
            }
        }

        fn failing(err: EngineError) -> Self {
            FakeEngine {
                retries_left: 0,
                handshake_calls: 0,
                fail_with: Some(err),
            }
        }
    }

    impl Engine for FakeEngine {
        fn handshake_step(&mut self) -> Result<Step<()>, EngineError> {
            self.handshake_calls += 1;
            if let Some(err) = self.fail_with.take() {
                return Err(err);
            }
            if self.retries_left > 0 {
                self.retries_left -= 1;
                return Ok(Step::Retry(Want::Write));
            }
            Ok(Step::Done(()))
        }

        fn read_step(&mut self, _buf: &mut [u8]) -> Result<Step<usize>, EngineError> {
            if self.retries_left > 0 {
                self.retries_left -= 1;
                return Ok(Step::Retry(Want::Write));
            }
            Ok(Step::Done(0))
        }

        fn write_step(&mut self, buf: &[u8]) -> Result<Step<usize>, EngineError> {
            if self.retries_left > 0 {
                self.retries_left -= 1;
                return Ok(Step::Retry(Want::Write));
            }
            Ok(Step::Done(buf.len()))
        }

        fn shutdown(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn peer_verified(&self) -> Result<(), EngineError> {
            Ok(())
        }

        fn peer_certificate(&self) -> Option<CertInfo> {
            None
        }

        fn negotiated(&self) -> Option<Negotiated> {
            None
        }
    }

    fn session_with(engine: FakeEngine) -> (Session<FakeEngine>, UnixStream, UnixStream) {
        // A real descriptor so the readiness poll has something to watch;
        // the write side of a fresh pair is always ready.
        let (a, b) = UnixStream::pair().unwrap();
        let mut session = Session::new(Role::Server, a.as_raw_fd(), true);
        session.bind_engine(engine).unwrap();
        (session, a, b)
    }

    #[test]
    fn test_handshake_retries_exactly_n_plus_one_times() {
        let (mut session, _a, _b) = session_with(FakeEngine::retrying(3));
        session.handshake().unwrap();

        assert_eq!(session.phase(), Phase::Established);
        assert_eq!(session.engine.as_ref().unwrap().handshake_calls, 4);
    }

    #[test]
    fn test_handshake_failure_is_terminal() {
        let err = EngineError::NegotiationFailed {
            code: 1,
            reason: "no shared cipher".to_string(),
        };
        let (mut session, _a, _b) = session_with(FakeEngine::failing(err));

        assert!(session.handshake().is_err());
        assert_eq!(session.phase(), Phase::Failed);
        // A failed session cannot handshake again.
        assert!(matches!(
            session.handshake(),
            Err(EngineError::ParamError { .. })
        ));
    }

    #[test]
    fn test_send_recv_require_established() {
        let (mut session, _a, _b) = session_with(FakeEngine::retrying(0));
        let mut buf = [0u8; 4];
        assert!(matches!(
            session.recv(&mut buf),
            Err(EngineError::ParamError { .. })
        ));
        assert!(matches!(
            session.send(b"x"),
            Err(EngineError::ParamError { .. })
        ));
    }

    #[test]
    fn test_send_retries_then_reports_bytes_written() {
        let (mut session, _a, _b) = session_with(FakeEngine::retrying(0));
        session.handshake().unwrap();

        session.engine.as_mut().unwrap().retries_left = 2;
        assert_eq!(session.send(b"hello").unwrap(), 5);
    }

    #[test]
    fn test_empty_payloads_are_noops() {
        let (mut session, _a, _b) = session_with(FakeEngine::retrying(0));
        session.handshake().unwrap();

        assert_eq!(session.send(&[]).unwrap(), 0);
        let mut empty: [u8; 0] = [];
        assert_eq!(session.recv(&mut empty).unwrap(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut session, _a, _b) = session_with(FakeEngine::retrying(0));
        session.handshake().unwrap();

        session.close().unwrap();
        assert_eq!(session.phase(), Phase::Closed);
        session.close().unwrap();
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[test]
    fn test_verify_connection_is_noop_for_self_signed_server() {
        let (a, _b) = UnixStream::pair().unwrap();
        // No engine bound at all: the self-signed server path must not
        // consult one.
        let session: Session<FakeEngine> = Session::new(Role::Server, a.as_raw_fd(), true);
        assert!(session.verify_connection().is_ok());

        let client: Session<FakeEngine> = Session::new(Role::Client, a.as_raw_fd(), true);
        assert!(client.verify_connection().is_err());
    }

    #[test]
    fn test_handshake_deadline_expires() {
        // Retry waiting for readable data that never arrives.
        struct StarvedEngine;
        impl Engine for StarvedEngine {
            fn handshake_step(&mut self) -> Result<Step<()>, EngineError> {
                Ok(Step::Retry(Want::Read))
            }
            fn read_step(&mut self, _buf: &mut [u8]) -> Result<Step<usize>, EngineError> {
                Ok(Step::Retry(Want::Read))
            }
            fn write_step(&mut self, _buf: &[u8]) -> Result<Step<usize>, EngineError> {
                Ok(Step::Retry(Want::Read))
            }
            fn shutdown(&mut self) -> Result<(), EngineError> {
                Ok(())
            }
            fn peer_verified(&self) -> Result<(), EngineError> {
                Ok(())
            }
            fn peer_certificate(&self) -> Option<CertInfo> {
                None
            }
            fn negotiated(&self) -> Option<Negotiated> {
                None
            }
        }

        let (a, _b) = UnixStream::pair().unwrap();
        let mut session = Session::new(Role::Client, a.as_raw_fd(), true);
        session.bind_engine(StarvedEngine).unwrap();
        session.set_timeout(Some(Duration::from_millis(50)));

        assert!(matches!(session.handshake(), Err(EngineError::TimedOut)));
        assert_eq!(session.phase(), Phase::Failed);
    }
}
