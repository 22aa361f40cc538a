//! rustls engine backend
//!
//! Alternative [`Engine`] implementation selected with the
//! `rustls-backend` feature. Trust and identity material is converted to
//! DER once at construction; all record-layer I/O goes through the same
//! [`BridgeIo`] adapter as the default backend.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{
    AlertDescription, Certificate, CertificateError, ClientConfig, ClientConnection, PrivateKey,
    ProtocolVersion, RootCertStore, ServerConfig, ServerConnection, ServerName,
    SupportedCipherSuite,
};

use crate::bridge::{BridgeIo, ByteChannel};
use crate::cert::CertInfo;
use crate::config::TlsConfig;
use crate::engine::{Engine, Negotiated, Step, Want};
use crate::error::EngineError;
use crate::identity::Identity;
use crate::session::Role;

enum Conn {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Conn {
    fn is_handshaking(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_handshaking(),
            Conn::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_read(),
            Conn::Server(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_write(),
            Conn::Server(c) => c.wants_write(),
        }
    }

    fn complete_io<T: Read + Write>(&mut self, io: &mut T) -> io::Result<(usize, usize)> {
        match self {
            Conn::Client(c) => c.complete_io(io),
            Conn::Server(c) => c.complete_io(io),
        }
    }

    fn write_tls<T: Write>(&mut self, io: &mut T) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.write_tls(io),
            Conn::Server(c) => c.write_tls(io),
        }
    }

    fn reader(&mut self) -> rustls::Reader {
        match self {
            Conn::Client(c) => c.reader(),
            Conn::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer {
        match self {
            Conn::Client(c) => c.writer(),
            Conn::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Conn::Client(c) => c.send_close_notify(),
            Conn::Server(c) => c.send_close_notify(),
        }
    }

    fn peer_certificates(&self) -> Option<&[Certificate]> {
        match self {
            Conn::Client(c) => c.peer_certificates(),
            Conn::Server(c) => c.peer_certificates(),
        }
    }

    fn protocol_version(&self) -> Option<ProtocolVersion> {
        match self {
            Conn::Client(c) => c.protocol_version(),
            Conn::Server(c) => c.protocol_version(),
        }
    }

    fn negotiated_cipher_suite(&self) -> Option<SupportedCipherSuite> {
        match self {
            Conn::Client(c) => c.negotiated_cipher_suite(),
            Conn::Server(c) => c.negotiated_cipher_suite(),
        }
    }
}

/// [`Engine`] implementation over `rustls`.
pub struct RustlsEngine<C: ByteChannel> {
    conn: Conn,
    io: BridgeIo<C>,
    /// Plaintext bytes accepted by the connection but not yet flushed;
    /// kept across retries so a re-invoked write step does not re-buffer.
    pending_write: Option<usize>,
}

impl<C: ByteChannel> RustlsEngine<C> {
    pub fn new(
        role: Role,
        config: &TlsConfig,
        identity: Identity,
        channel: C,
    ) -> Result<Self, EngineError> {
        let (cert_chain, key) = convert_identity(identity)?;

        let conn = match role {
            Role::Server => {
                let builder = match select_suites(config) {
                    Some(suites) => ServerConfig::builder()
                        .with_cipher_suites(&suites)
                        .with_safe_default_kx_groups()
                        .with_safe_default_protocol_versions()
                        .map_err(|e| EngineError::param(format!("protocol versions: {}", e)))?,
                    None => ServerConfig::builder().with_safe_defaults(),
                };
                let server_config = builder
                    .with_no_client_auth()
                    .with_single_cert(cert_chain, key)
                    .map_err(|e| EngineError::param(format!("identity install: {}", e)))?;
                Conn::Server(
                    ServerConnection::new(Arc::new(server_config))
                        .map_err(|e| EngineError::param(format!("session allocation: {}", e)))?,
                )
            }
            Role::Client => {
                let builder = match select_suites(config) {
                    Some(suites) => ClientConfig::builder()
                        .with_cipher_suites(&suites)
                        .with_safe_default_kx_groups()
                        .with_safe_default_protocol_versions()
                        .map_err(|e| EngineError::param(format!("protocol versions: {}", e)))?,
                    None => ClientConfig::builder().with_safe_defaults(),
                };
                let client_config = if config.is_self_signed() {
                    builder
                        .with_custom_certificate_verifier(Arc::new(NoVerification))
                        .with_client_auth_cert(cert_chain, key)
                } else {
                    builder
                        .with_root_certificates(load_roots(config)?)
                        .with_client_auth_cert(cert_chain, key)
                }
                .map_err(|e| EngineError::param(format!("identity install: {}", e)))?;

                let name = config.servername().unwrap_or("localhost");
                let name = ServerName::try_from(name)
                    .map_err(|e| EngineError::param(format!("servername: {}", e)))?;
                Conn::Client(
                    ClientConnection::new(Arc::new(client_config), name)
                        .map_err(|e| EngineError::param(format!("session allocation: {}", e)))?,
                )
            }
        };

        log::debug!("rustls connection ready ({:?})", role);
        Ok(RustlsEngine {
            conn,
            io: BridgeIo::new(channel),
            pending_write: None,
        })
    }

    fn want(&self) -> Want {
        if self.conn.wants_write() {
            Want::Write
        } else {
            Want::Read
        }
    }
}

impl<C: ByteChannel> Engine for RustlsEngine<C> {
    fn handshake_step(&mut self) -> Result<Step<()>, EngineError> {
        if !self.conn.is_handshaking() {
            return Ok(Step::Done(()));
        }
        match self.conn.complete_io(&mut self.io) {
            Ok(_) => {
                if self.conn.is_handshaking() {
                    Ok(Step::Retry(self.want()))
                } else {
                    Ok(Step::Done(()))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Step::Retry(self.want())),
            Err(e) => Err(map_fatal_io(&e)),
        }
    }

    fn read_step(&mut self, buf: &mut [u8]) -> Result<Step<usize>, EngineError> {
        if self.conn.wants_read() {
            match self.conn.complete_io(&mut self.io) {
                Ok(_) => {}
                // Already-buffered plaintext may still satisfy the read.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(map_fatal_io(&e)),
            }
        }
        match self.conn.reader().read(buf) {
            Ok(n) => Ok(Step::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Step::Retry(Want::Read)),
            Err(e) => Err(map_fatal_io(&e)),
        }
    }

    fn write_step(&mut self, buf: &[u8]) -> Result<Step<usize>, EngineError> {
        if self.pending_write.is_none() {
            let n = self
                .conn
                .writer()
                .write(buf)
                .map_err(|e| EngineError::param(format!("plaintext buffering: {}", e)))?;
            if n == 0 && !buf.is_empty() {
                // Plaintext buffer is full; flush ciphertext and retry.
                return self.flush_or_retry().map(|step| match step {
                    Step::Done(()) => Step::Retry(Want::Write),
                    Step::Retry(want) => Step::Retry(want),
                });
            }
            self.pending_write = Some(n);
        }
        match self.flush_or_retry()? {
            Step::Done(()) => Ok(Step::Done(self.pending_write.take().unwrap_or(0))),
            Step::Retry(want) => Ok(Step::Retry(want)),
        }
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.conn.send_close_notify();
        // Best-effort flush of the close notification.
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.io) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn peer_verified(&self) -> Result<(), EngineError> {
        if self.conn.is_handshaking() {
            return Err(EngineError::param("session is not established"));
        }
        // rustls verifies the peer during the handshake; reaching the
        // established state implies the configured verifier accepted it.
        Ok(())
    }

    fn peer_certificate(&self) -> Option<CertInfo> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|cert| CertInfo::from_der(&cert.0))
    }

    fn negotiated(&self) -> Option<Negotiated> {
        if self.conn.is_handshaking() {
            return None;
        }
        let version = match self.conn.protocol_version() {
            Some(ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
            Some(ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
            Some(other) => format!("{:?}", other),
            None => return None,
        };
        let cipher = self
            .conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_else(|| "<undef>".to_string());
        Some(Negotiated { version, cipher })
    }
}

impl<C: ByteChannel> RustlsEngine<C> {
    /// Flush buffered ciphertext; `Done` when the transmit queue is empty.
    fn flush_or_retry(&mut self) -> Result<Step<()>, EngineError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.io) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Retry(Want::Write))
                }
                Err(e) => return Err(map_fatal_io(&e)),
            }
        }
        Ok(Step::Done(()))
    }
}

fn convert_identity(identity: Identity) -> Result<(Vec<Certificate>, PrivateKey), EngineError> {
    let mut chain = Vec::with_capacity(1 + identity.chain.len());
    chain.push(Certificate(identity.cert.to_der().map_err(|e| {
        EngineError::param(format!("certificate encoding: {}", e))
    })?));
    for cert in &identity.chain {
        chain.push(Certificate(cert.to_der().map_err(|e| {
            EngineError::param(format!("chain certificate encoding: {}", e))
        })?));
    }
    let key = identity
        .key
        .private_key_to_pkcs8()
        .map_err(|e| EngineError::param(format!("key encoding: {}", e)))?;
    Ok((chain, PrivateKey(key)))
}

fn load_roots(config: &TlsConfig) -> Result<RootCertStore, EngineError> {
    let mut roots = RootCertStore::empty();
    if let Some(path) = config.ca_file() {
        let file = File::open(path)
            .map_err(|e| EngineError::param(format!("CA file {}: {}", path.display(), e)))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .map_err(|e| EngineError::param(format!("CA file {}: {}", path.display(), e)))?;
        roots.add_parsable_certificates(&certs);
    }
    if let Some(dir) = config.ca_dir() {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| EngineError::param(format!("CA directory {}: {}", dir.display(), e)))?;
        for entry in entries.flatten() {
            let Ok(file) = File::open(entry.path()) else {
                continue;
            };
            if let Ok(certs) = rustls_pemfile::certs(&mut BufReader::new(file)) {
                roots.add_parsable_certificates(&certs);
            }
        }
    }
    if roots.is_empty() {
        return Err(EngineError::param("no usable trust anchors"));
    }
    Ok(roots)
}

/// Match explicitly configured cipher identifiers against the suites this
/// backend supports. OpenSSL-style policy strings match nothing and fall
/// back to the safe defaults.
fn select_suites(config: &TlsConfig) -> Option<Vec<SupportedCipherSuite>> {
    let wanted: Vec<String> = config.ciphers().iter().map(|c| c.to_uppercase()).collect();
    let selected: Vec<SupportedCipherSuite> = rustls::ALL_CIPHER_SUITES
        .iter()
        .copied()
        .filter(|s| wanted.contains(&format!("{:?}", s.suite()).to_uppercase()))
        .collect();
    if selected.is_empty() {
        None
    } else {
        Some(selected)
    }
}

fn map_fatal_io(e: &io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => EngineError::ClosedAbort,
        io::ErrorKind::InvalidData => e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .map(map_rustls_error)
            .unwrap_or_else(|| EngineError::from_io(e)),
        _ => EngineError::from_io(e),
    }
}

fn map_rustls_error(err: &rustls::Error) -> EngineError {
    let reason = err.to_string();
    match err {
        rustls::Error::AlertReceived(AlertDescription::BadRecordMac)
        | rustls::Error::DecryptError => EngineError::BadRecordMac { code: 0, reason },
        rustls::Error::AlertReceived(AlertDescription::UnknownCA) => {
            EngineError::PeerUnknownCa { code: 0, reason }
        }
        rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer) => {
            EngineError::PeerUnknownCa { code: 0, reason }
        }
        rustls::Error::InvalidCertificate(_) => EngineError::AuthFailed { code: 0, reason },
        _ => EngineError::NegotiationFailed { code: 0, reason },
    }
}

/// Verifier for the self-signed mode: the peer authenticates by presenting
/// the expected identity, not by chaining to a root.
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
