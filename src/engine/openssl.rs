//! OpenSSL engine backend
//!
//! Wraps an `openssl` context/stream pair behind the [`Engine`] trait. The
//! handshake is driven through the crate's mid-handshake states so each
//! step maps onto one `SSL_do_handshake` round against the non-blocking
//! bridge.

use std::mem;

use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder,
    SslFiletype, SslMethod, SslStream, SslVerifyMode,
};
use openssl::x509::store::{X509Lookup, X509StoreBuilder};
use openssl::x509::X509VerifyResult;

use crate::bridge::{BridgeIo, ByteChannel};
use crate::cert::CertInfo;
use crate::config::TlsConfig;
use crate::engine::{Engine, Negotiated, Step, Want};
use crate::error::EngineError;
use crate::identity::Identity;
use crate::session::Role;

// Issuer-related entries of the X509_V_ERR_* space; everything else
// non-OK is a plain authentication failure.
const UNKNOWN_CA_CODES: &[i32] = &[
    2,  // unable to get issuer certificate
    18, // depth zero self-signed certificate
    19, // self-signed certificate in chain
    20, // unable to get local issuer certificate
    21, // unable to verify leaf signature
    27, // certificate untrusted
];

enum State<S> {
    Start { role: Role, ssl: Ssl, io: S },
    Mid(MidHandshakeSslStream<S>),
    Active(SslStream<S>),
    Gone,
}

/// [`Engine`] implementation over the `openssl` crate.
pub struct OpenSslEngine<C: ByteChannel> {
    state: State<BridgeIo<C>>,
}

impl<C: ByteChannel> OpenSslEngine<C> {
    /// Allocate a context for `role`, attach trust and identity material,
    /// apply the cipher list and wire the channel. No handshake traffic is
    /// produced until the first [`Engine::handshake_step`].
    pub fn new(
        role: Role,
        config: &TlsConfig,
        identity: Identity,
        channel: C,
    ) -> Result<Self, EngineError> {
        let ctx = build_context(role, config, identity)?;
        let mut ssl = Ssl::new(&ctx).map_err(|e| stack_error("session allocation", &e))?;
        if role == Role::Client {
            if let Some(name) = config.servername() {
                ssl.set_hostname(name)
                    .map_err(|e| stack_error("SNI servername", &e))?;
            }
        }
        log::debug!("openssl context ready ({:?})", role);
        Ok(OpenSslEngine {
            state: State::Start {
                role,
                ssl,
                io: BridgeIo::new(channel),
            },
        })
    }

    fn active_mut(&mut self) -> Result<&mut SslStream<BridgeIo<C>>, EngineError> {
        match &mut self.state {
            State::Active(stream) => Ok(stream),
            _ => Err(EngineError::param("session is not established")),
        }
    }

    fn resolve_handshake(
        &mut self,
        result: Result<SslStream<BridgeIo<C>>, HandshakeError<BridgeIo<C>>>,
    ) -> Result<Step<()>, EngineError> {
        match result {
            Ok(stream) => {
                self.state = State::Active(stream);
                Ok(Step::Done(()))
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                let want = if mid.error().code() == ErrorCode::WANT_WRITE {
                    Want::Write
                } else {
                    Want::Read
                };
                self.state = State::Mid(mid);
                Ok(Step::Retry(want))
            }
            Err(HandshakeError::SetupFailure(stack)) => {
                Err(stack_error("handshake setup", &stack))
            }
            Err(HandshakeError::Failure(mid)) => {
                let verify = mid.ssl().verify_result();
                if verify != X509VerifyResult::OK {
                    return Err(classify_verify_result(verify));
                }
                Err(map_ssl_error(mid.error()))
            }
        }
    }
}

impl<C: ByteChannel> Engine for OpenSslEngine<C> {
    fn handshake_step(&mut self) -> Result<Step<()>, EngineError> {
        match mem::replace(&mut self.state, State::Gone) {
            State::Start { role, ssl, io } => {
                let result = match role {
                    Role::Server => ssl.accept(io),
                    Role::Client => ssl.connect(io),
                };
                self.resolve_handshake(result)
            }
            State::Mid(mid) => {
                let result = mid.handshake();
                self.resolve_handshake(result)
            }
            State::Active(stream) => {
                self.state = State::Active(stream);
                Ok(Step::Done(()))
            }
            State::Gone => Err(EngineError::param("handshake on a closed session")),
        }
    }

    fn read_step(&mut self, buf: &mut [u8]) -> Result<Step<usize>, EngineError> {
        let stream = self.active_mut()?;
        match stream.ssl_read(buf) {
            Ok(n) => Ok(Step::Done(n)),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(Step::Done(0)),
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(Step::Retry(Want::Read)),
            Err(e) if e.code() == ErrorCode::WANT_WRITE => Ok(Step::Retry(Want::Write)),
            Err(e) => Err(map_ssl_error(&e)),
        }
    }

    fn write_step(&mut self, buf: &[u8]) -> Result<Step<usize>, EngineError> {
        let stream = self.active_mut()?;
        match stream.ssl_write(buf) {
            Ok(n) => Ok(Step::Done(n)),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(Step::Done(0)),
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(Step::Retry(Want::Read)),
            Err(e) if e.code() == ErrorCode::WANT_WRITE => Ok(Step::Retry(Want::Write)),
            Err(e) => Err(map_ssl_error(&e)),
        }
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        if let State::Active(mut stream) = mem::replace(&mut self.state, State::Gone) {
            // One close-notify attempt; a peer that already went away is
            // not an error on the way out.
            let _ = stream.shutdown();
        }
        Ok(())
    }

    fn peer_verified(&self) -> Result<(), EngineError> {
        match &self.state {
            State::Active(stream) => {
                let verify = stream.ssl().verify_result();
                if verify == X509VerifyResult::OK {
                    Ok(())
                } else {
                    Err(classify_verify_result(verify))
                }
            }
            _ => Err(EngineError::param("session is not established")),
        }
    }

    fn peer_certificate(&self) -> Option<CertInfo> {
        match &self.state {
            State::Active(stream) => stream
                .ssl()
                .peer_certificate()
                .map(|cert| CertInfo::from_x509(&cert)),
            _ => None,
        }
    }

    fn negotiated(&self) -> Option<Negotiated> {
        match &self.state {
            State::Active(stream) => Some(Negotiated {
                version: stream.ssl().version_str().to_string(),
                cipher: stream
                    .ssl()
                    .current_cipher()
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "<undef>".to_string()),
            }),
            _ => None,
        }
    }
}

fn build_context(
    role: Role,
    config: &TlsConfig,
    identity: Identity,
) -> Result<SslContext, EngineError> {
    let method = match role {
        Role::Server => SslMethod::tls_server(),
        Role::Client => SslMethod::tls_client(),
    };
    let mut builder =
        SslContextBuilder::new(method).map_err(|e| stack_error("context allocation", &e))?;

    // Trust material. The hashed-directory store must be installed before
    // the CA file so the file loads into the replacement store.
    if let Some(dir) = config.ca_dir() {
        let mut store = X509StoreBuilder::new().map_err(|e| stack_error("trust store", &e))?;
        let lookup = store
            .add_lookup(X509Lookup::hash_dir())
            .map_err(|e| stack_error("trust store lookup", &e))?;
        let dir = dir
            .to_str()
            .ok_or_else(|| EngineError::param("CA directory path is not valid UTF-8"))?;
        lookup
            .add_dir(dir, SslFiletype::PEM)
            .map_err(|e| stack_error("CA directory", &e))?;
        builder
            .set_verify_cert_store(store.build())
            .map_err(|e| stack_error("trust store install", &e))?;
    }
    if let Some(file) = config.ca_file() {
        builder
            .set_ca_file(file)
            .map_err(|e| stack_error("CA file", &e))?;
    }

    // Identity: leaf, intermediates in order, then the key.
    builder
        .set_certificate(&identity.cert)
        .map_err(|e| stack_error("certificate install", &e))?;
    for extra in identity.chain {
        builder
            .add_extra_chain_cert(extra)
            .map_err(|e| stack_error("chain certificate install", &e))?;
    }
    builder
        .set_private_key(&identity.key)
        .map_err(|e| stack_error("private key install", &e))?;
    builder
        .check_private_key()
        .map_err(|e| stack_error("key/certificate mismatch", &e))?;

    builder
        .set_cipher_list(&config.cipher_string())
        .map_err(|e| stack_error("cipher list", &e))?;

    let mode = if config.is_self_signed() {
        SslVerifyMode::NONE
    } else if role == Role::Server && config.ca_file().is_none() && config.ca_dir().is_none() {
        // A server with no trust material cannot evaluate client
        // certificates; requesting them would only manufacture failures.
        SslVerifyMode::NONE
    } else {
        SslVerifyMode::PEER
    };
    builder.set_verify(mode);

    Ok(builder.build())
}

fn stack_error(what: &str, stack: &ErrorStack) -> EngineError {
    EngineError::ParamError {
        reason: format!("{}: {}", what, stack),
    }
}

fn classify_verify_result(verify: X509VerifyResult) -> EngineError {
    let code = i64::from(verify.as_raw());
    let reason = verify.error_string().to_string();
    if UNKNOWN_CA_CODES.contains(&verify.as_raw()) {
        EngineError::PeerUnknownCa { code, reason }
    } else {
        EngineError::AuthFailed { code, reason }
    }
}

/// Narrow an `openssl` stream error to the local taxonomy.
fn map_ssl_error(e: &openssl::ssl::Error) -> EngineError {
    if let Some(io) = e.io_error() {
        return EngineError::from_io(io);
    }
    if let Some(stack) = e.ssl_error() {
        let code = stack.errors().first().map(|x| x.code() as i64).unwrap_or(0);
        let reason = stack.to_string();
        let lowered = reason.to_lowercase();
        if lowered.contains("bad record mac") {
            return EngineError::BadRecordMac { code, reason };
        }
        if lowered.contains("unexpected eof") {
            // The peer vanished mid-record without a close notification.
            return EngineError::ClosedAbort;
        }
        if lowered.contains("certificate verify failed") {
            return EngineError::AuthFailed { code, reason };
        }
        if lowered.contains("unknown ca") || lowered.contains("tlsv1 alert unknown ca") {
            return EngineError::PeerUnknownCa { code, reason };
        }
        return EngineError::NegotiationFailed { code, reason };
    }
    if e.code() == ErrorCode::SYSCALL {
        // EOF in the middle of the protocol with no errno recorded.
        return EngineError::ClosedAbort;
    }
    EngineError::NegotiationFailed {
        code: i64::from(e.code().as_raw()),
        reason: e.to_string(),
    }
}
