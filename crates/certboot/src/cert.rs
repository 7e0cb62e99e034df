//! Owned X.509 certificate and CRL wrappers.
//!
//! `x509-parser` works on borrowed DER, so the wrappers here own the DER
//! bytes and hand out short-lived parsed views. Construction validates the
//! DER once; anything that makes it into a `Cert` or `Crl` is parseable.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::revocation_list::CertificateRevocationList;

const CERT_TAG: &str = "CERTIFICATE";
const CRL_TAG: &str = "X509 CRL";

/// An owned X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cert {
    der: Vec<u8>,
    subject: String,
    issuer: String,
}

impl Cert {
    /// Wrap DER bytes, validating that they parse as a certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, String> {
        let (_, cert) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| format!("failed to parse certificate: {e}"))?;
        let subject = cert.subject().to_string();
        let issuer = cert.issuer().to_string();
        Ok(Self {
            der,
            subject,
            issuer,
        })
    }

    /// Parse the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(data: &[u8]) -> Result<Self, String> {
        let blocks = pem::parse_many(data).map_err(|e| e.to_string())?;
        let block = blocks
            .iter()
            .find(|p| p.tag() == CERT_TAG)
            .ok_or_else(|| "no CERTIFICATE block found".to_string())?;
        Self::from_der(block.contents().to_vec())
    }

    /// Raw DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name (human-readable).
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name (human-readable).
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// SHA-256 fingerprint of the DER encoding (hex).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.der);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// PEM encoding.
    #[must_use]
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(CERT_TAG, self.der.clone()))
    }

    /// Borrowed parsed view of the certificate.
    ///
    /// Construction already validated the DER, so this only fails if the
    /// bytes were corrupted in memory.
    pub(crate) fn x509(&self) -> Result<X509Certificate<'_>, String> {
        x509_parser::parse_x509_certificate(&self.der)
            .map(|(_, c)| c)
            .map_err(|e| format!("failed to reparse certificate: {e}"))
    }

    /// Not-valid-after timestamp.
    #[must_use]
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        let cert = self.x509().ok()?;
        let epoch = cert.validity().not_after.timestamp();
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// An owned X.509 certificate revocation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crl {
    der: Vec<u8>,
    issuer: String,
}

impl Crl {
    /// Wrap DER bytes, validating that they parse as a CRL.
    pub fn from_der(der: Vec<u8>) -> Result<Self, String> {
        let (_, crl) = x509_parser::parse_x509_crl(&der)
            .map_err(|e| format!("failed to parse CRL: {e}"))?;
        let issuer = crl.issuer().to_string();
        Ok(Self { der, issuer })
    }

    /// Raw DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Issuer distinguished name (human-readable).
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// PEM encoding.
    #[must_use]
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(CRL_TAG, self.der.clone()))
    }

    /// Borrowed parsed view of the CRL.
    pub(crate) fn x509(&self) -> Result<CertificateRevocationList<'_>, String> {
        x509_parser::parse_x509_crl(&self.der)
            .map(|(_, c)| c)
            .map_err(|e| format!("failed to reparse CRL: {e}"))
    }
}

/// Parse a PEM bundle of one or more concatenated certificates.
///
/// The bundle is rejected whole if any block is not a parseable
/// certificate; a partially-valid bundle is never accepted.
pub fn parse_cert_bundle(data: &[u8]) -> Result<Vec<Cert>, String> {
    let blocks = pem::parse_many(data).map_err(|e| e.to_string())?;
    if blocks.is_empty() {
        return Err("no PEM data found".to_string());
    }
    let mut certs = Vec::with_capacity(blocks.len());
    for block in &blocks {
        if block.tag() != CERT_TAG {
            return Err(format!("expected CERTIFICATE, found {}", block.tag()));
        }
        certs.push(Cert::from_der(block.contents().to_vec())?);
    }
    Ok(certs)
}

/// Parse a PEM bundle of one or more concatenated CRLs.
///
/// Same all-or-nothing contract as [`parse_cert_bundle`].
pub fn parse_crl_bundle(data: &[u8]) -> Result<Vec<Crl>, String> {
    let blocks = pem::parse_many(data).map_err(|e| e.to_string())?;
    if blocks.is_empty() {
        return Err("no PEM data found".to_string());
    }
    let mut crls = Vec::with_capacity(blocks.len());
    for block in &blocks {
        if block.tag() != CRL_TAG {
            return Err(format!("expected X509 CRL, found {}", block.tag()));
        }
        crls.push(Crl::from_der(block.contents().to_vec())?);
    }
    Ok(crls)
}

/// Serialize certificates as a concatenated PEM bundle.
#[must_use]
pub fn cert_bundle_to_pem(certs: &[Cert]) -> String {
    certs.iter().map(Cert::to_pem).collect()
}

/// Serialize CRLs as a concatenated PEM bundle.
#[must_use]
pub fn crl_bundle_to_pem(crls: &[Crl]) -> String {
    crls.iter().map(Crl::to_pem).collect()
}
