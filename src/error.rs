//! Error taxonomy for TLS session setup and I/O.
//!
//! The engine's native status space is large; everything that reaches a
//! caller is narrowed to three families. `ConfigError` is raised before any
//! engine resource exists, `LoadError` during identity loading, and
//! `EngineError` by handshake/send/recv. A session that reports an
//! `EngineError` is dead and must be closed and discarded.
//!
//! Would-block and orderly peer shutdown are deliberately absent: the former
//! is an internal retry signal, the latter is a normal zero-length result.

use std::path::PathBuf;

/// Configuration failures detected by [`TlsConfig::validate`].
///
/// Always surfaced synchronously from setup calls and never retried.
///
/// [`TlsConfig::validate`]: crate::config::TlsConfig::validate
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing credential: no {0} configured")]
    MissingCredential(&'static str),

    #[error("no trust anchor configured: need a CA file or CA directory")]
    MissingTrustAnchor,

    #[error("{field} does not exist: {}", path.display())]
    PathNotFound {
        field: &'static str,
        path: PathBuf,
    },
}

/// Identity loading failures. Fatal to the connection attempt being set up.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("chain file is a PKCS#12 bundle but no password is configured")]
    MissingPassword,

    #[error("identity import failed (code {code}): {reason}")]
    ImportFailed { code: i64, reason: String },
}

/// Fatal engine-side failures raised by handshake, send and recv.
///
/// Each variant carries the engine's native numeric code where one exists,
/// so callers can log the exact foreign status alongside the local kind.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("TLS negotiation failed (code {code}): {reason}")]
    NegotiationFailed { code: i64, reason: String },

    #[error("peer certificate issued by an unknown CA (code {code}): {reason}")]
    PeerUnknownCa { code: i64, reason: String },

    #[error("bad record MAC (code {code}): {reason}")]
    BadRecordMac { code: i64, reason: String },

    #[error("invalid parameter or session state: {reason}")]
    ParamError { reason: String },

    #[error("peer authentication failed (code {code}): {reason}")]
    AuthFailed { code: i64, reason: String },

    #[error("connection aborted by peer")]
    ClosedAbort,

    #[error("operation timed out")]
    TimedOut,

    #[error("I/O error (errno {code}): {reason}")]
    Io { code: i64, reason: String },
}

impl EngineError {
    /// Wrap a raw OS error from the socket layer.
    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::ConnectionReset {
            return EngineError::ClosedAbort;
        }
        EngineError::Io {
            code: i64::from(err.raw_os_error().unwrap_or(0)),
            reason: err.to_string(),
        }
    }

    pub(crate) fn param(reason: impl Into<String>) -> Self {
        EngineError::ParamError {
            reason: reason.into(),
        }
    }
}

/// Umbrella error for session establishment through the service layer.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
