//! Session factory
//!
//! The service owns the long-lived configuration and turns connected
//! sockets into established sessions: validate the configuration, load the
//! identity, build an engine wired to the socket's descriptor, and drive
//! the handshake to completion before handing the session back. The
//! returned session is the socket's delegate from then on — all further
//! traffic on that connection goes through `send`/`recv`.
//!
//! The configuration is shared read-only across connections; every engine
//! context, identity and descriptor is exclusively owned by one session.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::bridge::SocketBridge;
use crate::config::TlsConfig;
use crate::error::{EngineError, TlsError};
use crate::identity::load_identity;
use crate::session::{Role, Session};

#[cfg(feature = "openssl-backend")]
pub type DefaultEngine = crate::engine::openssl::OpenSslEngine<SocketBridge>;

#[cfg(all(feature = "rustls-backend", not(feature = "openssl-backend")))]
pub type DefaultEngine = crate::engine::rustls::RustlsEngine<SocketBridge>;

/// TLS service for one endpoint role.
///
/// Construct once with the endpoint's configuration, then feed it
/// connected sockets via [`on_accept`] or [`on_connect`].
///
/// [`on_accept`]: TlsService::on_accept
/// [`on_connect`]: TlsService::on_connect
pub struct TlsService {
    config: TlsConfig,
    role: Role,
    timeout: Option<Duration>,
}

impl TlsService {
    pub fn new(config: TlsConfig, as_server: bool) -> Self {
        TlsService {
            config,
            role: if as_server { Role::Server } else { Role::Client },
            timeout: None,
        }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Deadline applied to the handshake and inherited by the session's
    /// send/recv retry loops. `None` (the default) retries indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Establish a server-side session on a freshly accepted socket.
    pub fn on_accept<S: AsRawFd>(&self, sock: &S) -> Result<Session<DefaultEngine>, TlsError> {
        if self.role != Role::Server {
            return Err(EngineError::param("on_accept requires a server service").into());
        }
        self.prepare_connection(sock.as_raw_fd())
    }

    /// Establish a client-side session on a freshly connected socket.
    pub fn on_connect<S: AsRawFd>(&self, sock: &S) -> Result<Session<DefaultEngine>, TlsError> {
        if self.role != Role::Client {
            return Err(EngineError::param("on_connect requires a client service").into());
        }
        self.prepare_connection(sock.as_raw_fd())
    }

    fn prepare_connection(&self, fd: RawFd) -> Result<Session<DefaultEngine>, TlsError> {
        // Fail fast on bad configuration; no engine state exists yet.
        self.config.validate()?;
        let identity = load_identity(&self.config)?;

        // The engine's retry contract assumes the descriptor never blocks.
        set_nonblocking(fd).map_err(|e| TlsError::Engine(EngineError::from_io(&e)))?;

        let mut session = Session::new(self.role, fd, self.config.is_self_signed());
        session.set_timeout(self.timeout);
        let engine = build_engine(self.role, &self.config, identity, SocketBridge::new(fd))?;
        session.bind_engine(engine)?;

        log::debug!("starting {:?} handshake on fd {}", self.role, fd);
        session.handshake()?;
        Ok(session)
    }
}

#[cfg(feature = "openssl-backend")]
fn build_engine(
    role: Role,
    config: &TlsConfig,
    identity: crate::identity::Identity,
    bridge: SocketBridge,
) -> Result<DefaultEngine, EngineError> {
    crate::engine::openssl::OpenSslEngine::new(role, config, identity, bridge)
}

#[cfg(all(feature = "rustls-backend", not(feature = "openssl-backend")))]
fn build_engine(
    role: Role,
    config: &TlsConfig,
    identity: crate::identity::Identity,
    bridge: SocketBridge,
) -> Result<DefaultEngine, EngineError> {
    crate::engine::rustls::RustlsEngine::new(role, config, identity, bridge)
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
