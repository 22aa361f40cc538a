//! Identity loading
//!
//! Turns the configured certificate material into an engine-consumable
//! identity: a private key, the leaf certificate and the ordered chain of
//! intermediates. Two sources are supported: PEM (discrete cert+key files
//! or a leaf-first chain file) and password-protected PKCS#12 bundles.

use std::fs;
use std::path::Path;

use openssl::error::ErrorStack;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::config::TlsConfig;
use crate::error::LoadError;

/// A loaded identity, owned by the caller until handed to a session, which
/// takes ownership for the connection's duration.
pub struct Identity {
    pub key: PKey<Private>,
    pub cert: X509,
    pub chain: Vec<X509>,
}

/// Load the identity described by `config`.
///
/// The config is expected to have passed [`TlsConfig::validate`]; paths are
/// read but not re-checked here.
pub fn load_identity(config: &TlsConfig) -> Result<Identity, LoadError> {
    match config.chain_file() {
        Some(path) => {
            let bytes = read_file(path)?;
            if is_pkcs12(path, &bytes) {
                load_pkcs12(config, &bytes)
            } else {
                load_pem_chain(config, &bytes)
            }
        }
        None => load_pem_pair(config),
    }
}

/// A bundle is treated as PKCS#12 when the extension says so or the content
/// is not PEM-armored.
fn is_pkcs12(path: &Path, bytes: &[u8]) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("p12") || ext.eq_ignore_ascii_case("pfx") => true,
        _ => !bytes.starts_with(b"-----BEGIN"),
    }
}

fn load_pkcs12(config: &TlsConfig, bytes: &[u8]) -> Result<Identity, LoadError> {
    let password = config.password().ok_or(LoadError::MissingPassword)?;

    let bundle = Pkcs12::from_der(bytes).map_err(|e| import_failed("not a PKCS#12 bundle", e))?;
    let parsed = bundle
        .parse2(password)
        .map_err(|e| import_failed("PKCS#12 import failed", e))?;

    // The identity is the key+cert pair the bundle binds together; the
    // chain is every remaining entry in bundle order. Bundles missing
    // either half are rejected rather than guessed at.
    let key = parsed.pkey.ok_or_else(|| LoadError::ImportFailed {
        code: 0,
        reason: "bundle contains no private key".to_string(),
    })?;
    let cert = parsed.cert.ok_or_else(|| LoadError::ImportFailed {
        code: 0,
        reason: "bundle contains no certificate matching the private key".to_string(),
    })?;
    let chain: Vec<X509> = parsed
        .ca
        .map(|stack| stack.into_iter().collect())
        .unwrap_or_default();

    log::debug!("loaded PKCS#12 identity with {} chain entries", chain.len());
    Ok(Identity { key, cert, chain })
}

fn load_pem_chain(config: &TlsConfig, bytes: &[u8]) -> Result<Identity, LoadError> {
    let mut certs = X509::stack_from_pem(bytes)
        .map_err(|e| import_failed("chain file holds no parseable certificates", e))?;
    if certs.is_empty() {
        return Err(LoadError::ImportFailed {
            code: 0,
            reason: "chain file holds no certificates".to_string(),
        });
    }
    let cert = certs.remove(0);

    // Key from the configured key file when set, else from the chain file
    // itself (combined cert+key bundles).
    let key = match config.key_file() {
        Some(path) => private_key_from_file(path)?,
        None => PKey::private_key_from_pem(bytes)
            .map_err(|e| import_failed("chain file holds no private key", e))?,
    };

    Ok(Identity {
        key,
        cert,
        chain: certs,
    })
}

fn load_pem_pair(config: &TlsConfig) -> Result<Identity, LoadError> {
    let cert_path = config.cert_file().ok_or_else(|| LoadError::ImportFailed {
        code: 0,
        reason: "no certificate source configured".to_string(),
    })?;
    let bytes = read_file(cert_path)?;

    let mut certs = X509::stack_from_pem(&bytes)
        .map_err(|e| import_failed("certificate file is not valid PEM", e))?;
    if certs.is_empty() {
        return Err(LoadError::ImportFailed {
            code: 0,
            reason: "certificate file holds no certificates".to_string(),
        });
    }
    let cert = certs.remove(0);

    let key = match config.key_file() {
        Some(path) if path != cert_path => private_key_from_file(path)?,
        _ => PKey::private_key_from_pem(&bytes)
            .map_err(|e| import_failed("certificate file holds no private key", e))?,
    };

    Ok(Identity {
        key,
        cert,
        chain: certs,
    })
}

fn private_key_from_file(path: &Path) -> Result<PKey<Private>, LoadError> {
    let bytes = read_file(path)?;
    PKey::private_key_from_pem(&bytes).map_err(|e| import_failed("key file is not a valid key", e))
}

fn read_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|e| LoadError::ImportFailed {
        code: i64::from(e.raw_os_error().unwrap_or(0)),
        reason: format!("{}: {}", path.display(), e),
    })
}

fn import_failed(what: &str, stack: ErrorStack) -> LoadError {
    let code = stack
        .errors()
        .first()
        .map(|e| e.code() as i64)
        .unwrap_or(0);
    LoadError::ImportFailed {
        code,
        reason: format!("{}: {}", what, stack),
    }
}
