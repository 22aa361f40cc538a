//! Peer certificate inspection
//!
//! Small view over the X.509 material a session negotiated, used for
//! post-handshake diagnostics and logging.

use openssl::nid::Nid;
use openssl::x509::{X509, X509NameRef, X509Ref};

/// Summary of a peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject Common Name.
    pub subject: String,
    /// Issuer Common Name.
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses).
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: get_cn(cert.subject_name()),
            issuer: get_cn(cert.issuer_name()),
            subject_alt_names: get_subject_alt_names(cert),
        }
    }

    /// Parse a DER-encoded certificate, as handed back by engines that
    /// traffic in raw DER.
    pub fn from_der(der: &[u8]) -> Option<Self> {
        X509::from_der(der).ok().map(|c| CertInfo::from_x509(&c))
    }
}

fn get_cn(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn get_subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(san_ext) = cert.subject_alt_names() {
        for name in san_ext {
            if let Some(dns) = name.dnsname() {
                names.push(format!("DNS:{}", dns));
            } else if let Some(ip) = name.ipaddress() {
                if ip.len() == 4 {
                    names.push(format!("IP:{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]));
                }
            }
        }
    }
    names
}
