//! Shared fixtures: throwaway keys, certificates and CA hierarchies
//! written to disk for the configuration layer to pick up.
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509, X509NameBuilder};
use tempfile::NamedTempFile;

pub fn new_key() -> PKey<Private> {
    let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
    PKey::from_rsa(rsa).unwrap()
}

fn name(cn: &str) -> openssl::x509::X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

fn random_serial() -> Asn1Integer {
    let mut bn = BigNum::new().unwrap();
    bn.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    Asn1Integer::from_bn(&bn).unwrap()
}

/// A self-signed CA certificate and its key.
pub fn make_ca(cn: &str) -> (PKey<Private>, X509) {
    let key = new_key();
    let name = name(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

/// A leaf certificate for `cn` signed by the given CA, with a
/// `localhost` SAN so loop-back handshakes line up.
pub fn issue_cert(ca_key: &PKey<Private>, ca_cert: &X509, cn: &str) -> (PKey<Private>, X509) {
    let key = new_key();
    let subject = name(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(ca_cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .build(&builder.x509v3_context(Some(ca_cert), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

/// A self-signed leaf (its own CA), the shape the self-signed mode uses.
pub fn make_self_signed(cn: &str) -> (PKey<Private>, X509) {
    make_ca(cn)
}

/// Write PEM fragments into one temp file.
pub fn write_pem(parts: &[Vec<u8>]) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".pem").tempfile().unwrap();
    for part in parts {
        file.write_all(part).unwrap();
    }
    file.flush().unwrap();
    file
}

pub fn cert_pem(cert: &X509) -> Vec<u8> {
    cert.to_pem().unwrap()
}

pub fn key_pem(key: &PKey<Private>) -> Vec<u8> {
    key.private_key_to_pem_pkcs8().unwrap()
}

/// Install a CA certificate into `dir` under its OpenSSL hashed name
/// (`HHHHHHHH.0`), the layout a pre-hashed CA directory expects.
pub fn install_hashed_ca(dir: &Path, cert: &X509) {
    let hash = cert.subject_name_hash();
    let path = dir.join(format!("{:08x}.0", hash));
    std::fs::write(path, cert.to_pem().unwrap()).unwrap();
}
