//! tlslink - TLS session layer for caller-owned sockets
//!
//! This crate turns an already-connected plaintext socket into an
//! encrypted bidirectional stream: it validates a certificate
//! configuration, loads the identity (PEM or PKCS#12), drives the TLS
//! handshake over a non-blocking descriptor, and exposes `send`/`recv`
//! primitives that encrypt and decrypt over the same socket.
//!
//! # Architecture
//!
//! 1. [`TlsConfig`] describes identity material, trust material and cipher
//!    policy, fixed at construction.
//! 2. [`TlsService`] is the per-endpoint factory: it validates the
//!    configuration, loads the identity and establishes sessions on
//!    accepted or connected sockets.
//! 3. [`Session`] owns one engine context bound to one descriptor and
//!    walks `handshake` → `send`/`recv` → `close`.
//! 4. The engine itself is swappable: the `openssl-backend` feature (the
//!    default) drives OpenSSL, `rustls-backend` drives rustls, both behind
//!    the same internal capability trait.
//!
//! The socket's lifecycle stays with the caller throughout; sessions hold
//! the descriptor by value only.
//!
//! # Examples
//!
//! ## Server side
//!
//! ```no_run
//! use tlslink::{TlsConfig, TlsService};
//! use std::net::TcpListener;
//!
//! let config = TlsConfig::self_signed()
//!     .cert_file("server.pem")
//!     .key_file("server.key")
//!     .build();
//! let service = TlsService::new(config, true);
//!
//! let listener = TcpListener::bind("127.0.0.1:4433").unwrap();
//! let (stream, _) = listener.accept().unwrap();
//! let mut session = service.on_accept(&stream).unwrap();
//!
//! let mut buf = [0u8; 4096];
//! let n = session.recv(&mut buf).unwrap();
//! session.send(&buf[..n]).unwrap();
//! session.close().unwrap();
//! ```
//!
//! ## Client side
//!
//! ```no_run
//! use tlslink::{TlsConfig, TlsService};
//! use std::net::TcpStream;
//!
//! let config = TlsConfig::with_ca_file("ca.pem")
//!     .cert_file("client.pem")
//!     .key_file("client.key")
//!     .servername("example.com")
//!     .build();
//! let service = TlsService::new(config, false);
//!
//! let stream = TcpStream::connect("example.com:4433").unwrap();
//! let mut session = service.on_connect(&stream).unwrap();
//! session.send(b"hello").unwrap();
//! ```

#[cfg(not(any(feature = "openssl-backend", feature = "rustls-backend")))]
compile_error!("enable at least one engine backend: `openssl-backend` or `rustls-backend`");

pub mod bridge;
pub mod cert;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod service;
pub mod session;

pub use bridge::{BridgeIo, ByteChannel, IoStatus, SocketBridge};
pub use cert::CertInfo;
pub use config::{TlsConfig, TlsConfigBuilder, DEFAULT_CIPHERS};
pub use engine::{Engine, Negotiated, Step, Want};
pub use error::{ConfigError, EngineError, LoadError, TlsError};
pub use identity::{load_identity, Identity};
pub use service::{DefaultEngine, TlsService};
pub use session::{Phase, Role, Session};

/// Result type for TLS operations.
pub type Result<T> = std::result::Result<T, TlsError>;
