//! Engine capability interface
//!
//! The session and factory logic is written once against this trait; the
//! concrete TLS engine behind it is selected at build time via cargo
//! features (`openssl-backend` is the default, `rustls-backend` the
//! alternative).
//!
//! Every `*_step` method performs exactly one engine round and reports
//! [`Step::Retry`] when the underlying channel would block, so the caller
//! owns the retry loop: it decides how to wait for descriptor readiness
//! and how long, and the loop stays observable under test.

use crate::cert::CertInfo;
use crate::error::EngineError;

#[cfg(feature = "openssl-backend")]
pub mod openssl;

#[cfg(feature = "rustls-backend")]
pub mod rustls;

/// Which descriptor readiness a retry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

/// Outcome of a single engine round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// The operation completed.
    Done(T),
    /// The channel would block; retry once the descriptor is ready.
    Retry(Want),
}

/// Parameters negotiated during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: String,
    pub cipher: String,
}

/// The capability surface a TLS engine must expose.
///
/// An engine is exclusively owned by one session and is dead once any
/// method returns an [`EngineError`].
pub trait Engine {
    /// Advance the handshake by one round. `Done(())` once established;
    /// idempotent afterwards.
    fn handshake_step(&mut self) -> Result<Step<()>, EngineError>;

    /// Decrypt one round of application data into `buf`. `Done(0)` means
    /// the peer performed an orderly shutdown.
    fn read_step(&mut self, buf: &mut [u8]) -> Result<Step<usize>, EngineError>;

    /// Encrypt and flush one round of application data from `buf`,
    /// reporting how many plaintext bytes were consumed.
    fn write_step(&mut self, buf: &[u8]) -> Result<Step<usize>, EngineError>;

    /// Send the close notification, best effort. The engine is unusable
    /// afterwards.
    fn shutdown(&mut self) -> Result<(), EngineError>;

    /// Whether the peer passed certificate verification.
    fn peer_verified(&self) -> Result<(), EngineError>;

    /// The peer's leaf certificate, when one was presented.
    fn peer_certificate(&self) -> Option<CertInfo>;

    /// Negotiated protocol version and cipher, once established.
    fn negotiated(&self) -> Option<Negotiated>;
}
