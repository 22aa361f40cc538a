//! TLS configuration
//!
//! This module provides the immutable configuration value consumed by the
//! session factory: identity material, trust material and cipher policy.
//!
//! A configuration is created through one of the named constructors, each
//! fixing the trust mode up front, and is read-only after `build()`:
//!
//! ```no_run
//! use tlslink::TlsConfig;
//!
//! // Verified mode, trust anchors from a CA bundle file.
//! let config = TlsConfig::with_ca_file("ca.pem")
//!     .cert_file("server.pem")
//!     .key_file("server.key")
//!     .build();
//!
//! // Self-signed mode, cert and key only.
//! let config = TlsConfig::self_signed()
//!     .cert_file("server.pem")
//!     .build();
//! ```
//!
//! Validation is a pure filesystem check and runs to completion before any
//! engine resource is allocated.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Default cipher policy applied when no explicit list is configured.
pub const DEFAULT_CIPHERS: &[&str] = &["HIGH", "!aNULL", "!eNULL", "!MD5", "!RC4"];

/// Immutable TLS configuration.
///
/// Exactly one identity-sourcing mode is in effect per session: a chain file
/// (PEM chain or PKCS#12 bundle), or a discrete cert+key pair. The chain
/// file, when set, supersedes the discrete pair requirement.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    ca_file: Option<PathBuf>,
    ca_dir: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    chain_file: Option<PathBuf>,
    self_signed: bool,
    ciphers: Vec<String>,
    password: Option<String>,
    servername: Option<String>,
}

impl TlsConfig {
    /// Verified mode with trust anchors loaded from a single CA bundle file.
    pub fn with_ca_file(path: impl Into<PathBuf>) -> TlsConfigBuilder {
        let mut builder = TlsConfigBuilder::new(false);
        builder.ca_file = Some(path.into());
        builder
    }

    /// Verified mode with trust anchors from a pre-hashed CA directory
    /// (`c_rehash`-style symlink layout).
    pub fn with_ca_dir(path: impl Into<PathBuf>) -> TlsConfigBuilder {
        let mut builder = TlsConfigBuilder::new(false);
        builder.ca_dir = Some(path.into());
        builder
    }

    /// Verified mode with the identity taken from a chain file: either a PEM
    /// chain (leaf first) or a password-protected PKCS#12 bundle.
    pub fn with_chain_file(path: impl Into<PathBuf>) -> TlsConfigBuilder {
        let mut builder = TlsConfigBuilder::new(false);
        builder.chain_file = Some(path.into());
        builder
    }

    /// Self-signed mode: authentication rests solely on presenting the
    /// configured cert+key pair, no peer verification.
    pub fn self_signed() -> TlsConfigBuilder {
        TlsConfigBuilder::new(true)
    }

    /// Check the configuration for completeness and existence of every
    /// referenced file. Pure; no engine resource is touched.
    ///
    /// Rules, in order: self-signed mode requires a cert+key pair; verified
    /// mode without a chain file requires a trust anchor and a cert+key
    /// pair; every set path must exist, and the CA directory must actually
    /// be a directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.self_signed {
            if self.cert_file.is_none() {
                return Err(ConfigError::MissingCredential("certificate file"));
            }
            if self.key_file.is_none() {
                return Err(ConfigError::MissingCredential("key file"));
            }
        } else if self.chain_file.is_none() {
            if self.ca_file.is_none() && self.ca_dir.is_none() {
                return Err(ConfigError::MissingTrustAnchor);
            }
            if self.cert_file.is_none() {
                return Err(ConfigError::MissingCredential("certificate file"));
            }
            if self.key_file.is_none() {
                return Err(ConfigError::MissingCredential("key file"));
            }
        }

        // Existence checks in fixed order: CA file, CA directory, cert
        // file, key file, chain file.
        if let Some(path) = &self.ca_file {
            Self::check_exists("CA file", path)?;
        }
        if let Some(path) = &self.ca_dir {
            Self::check_exists("CA directory", path)?;
            if !path.is_dir() {
                return Err(ConfigError::PathNotFound {
                    field: "CA directory",
                    path: path.clone(),
                });
            }
        }
        if let Some(path) = &self.cert_file {
            Self::check_exists("certificate file", path)?;
        }
        if let Some(path) = &self.key_file {
            Self::check_exists("key file", path)?;
        }
        if let Some(path) = &self.chain_file {
            Self::check_exists("chain file", path)?;
        }

        Ok(())
    }

    fn check_exists(field: &'static str, path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            return Err(ConfigError::PathNotFound {
                field,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    pub fn ca_dir(&self) -> Option<&Path> {
        self.ca_dir.as_deref()
    }

    pub fn cert_file(&self) -> Option<&Path> {
        self.cert_file.as_deref()
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn chain_file(&self) -> Option<&Path> {
        self.chain_file.as_deref()
    }

    pub fn is_self_signed(&self) -> bool {
        self.self_signed
    }

    pub fn ciphers(&self) -> &[String] {
        &self.ciphers
    }

    /// The cipher list in the engine's colon-separated format.
    pub fn cipher_string(&self) -> String {
        self.ciphers.join(":")
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }
}

/// Builder for [`TlsConfig`]. Obtained through the named constructors on
/// [`TlsConfig`]; the trust mode is fixed at creation.
pub struct TlsConfigBuilder {
    ca_file: Option<PathBuf>,
    ca_dir: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    chain_file: Option<PathBuf>,
    self_signed: bool,
    ciphers: Vec<String>,
    password: Option<String>,
    servername: Option<String>,
}

impl TlsConfigBuilder {
    fn new(self_signed: bool) -> Self {
        TlsConfigBuilder {
            ca_file: None,
            ca_dir: None,
            cert_file: None,
            key_file: None,
            chain_file: None,
            self_signed,
            ciphers: Vec::new(),
            password: None,
            servername: None,
        }
    }

    /// Set the certificate file (PEM).
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    /// Set the private key file (PEM). Defaults to the certificate file
    /// when left unset at build time.
    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    /// Add a CA bundle file as an additional trust source.
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Add a pre-hashed CA directory as an additional trust source.
    pub fn ca_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(path.into());
        self
    }

    /// Password for a PKCS#12 chain file.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// SNI servername sent by client sessions.
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Replace the cipher policy with an explicit ordered list.
    pub fn ciphers<I, S>(mut self, ciphers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ciphers = ciphers.into_iter().map(Into::into).collect();
        self
    }

    /// Build the immutable configuration, applying defaults.
    pub fn build(self) -> TlsConfig {
        let key_file = self.key_file.or_else(|| self.cert_file.clone());
        let ciphers = if self.ciphers.is_empty() {
            DEFAULT_CIPHERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.ciphers
        };
        TlsConfig {
            ca_file: self.ca_file,
            ca_dir: self.ca_dir,
            cert_file: self.cert_file,
            key_file,
            chain_file: self.chain_file,
            self_signed: self.self_signed,
            ciphers,
            password: self.password,
            servername: self.servername,
        }
    }
}
