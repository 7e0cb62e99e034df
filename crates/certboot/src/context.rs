//! Trust and identity snapshots.
//!
//! An [`SslContext`] is an immutable view of everything the node currently
//! trusts and owns: the CA chain, CRLs, and (once issued) its private key
//! and client certificate. [`SslContextBuilder`] performs all semantic
//! validation; contexts that fail validation are never constructed.

use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::cert::{Cert, Crl};
use crate::error::{Error, Result};
use crate::key::PrivateKey;

/// An immutable snapshot of trust and identity material.
#[derive(Debug, Clone)]
pub struct SslContext {
    cacerts: Vec<Cert>,
    crls: Vec<Crl>,
    private_key: Option<PrivateKey>,
    client_cert: Option<Cert>,
    verify_peer: bool,
}

impl SslContext {
    /// A context with no trust material and peer verification disabled.
    ///
    /// Used for exactly one request: the initial CA bundle download,
    /// before any trust anchors exist.
    #[must_use]
    pub fn insecure() -> Self {
        Self {
            cacerts: Vec::new(),
            crls: Vec::new(),
            private_key: None,
            client_cert: None,
            verify_peer: false,
        }
    }

    /// CA certificates forming the trust chain, root last.
    #[must_use]
    pub fn cacerts(&self) -> &[Cert] {
        &self.cacerts
    }

    /// CRLs aligned with the trust chain. Empty iff revocation is disabled.
    #[must_use]
    pub fn crls(&self) -> &[Crl] {
        &self.crls
    }

    /// The node's private key, once generated or loaded.
    #[must_use]
    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    /// The node's client certificate, once issued and validated.
    #[must_use]
    pub fn client_cert(&self) -> Option<&Cert> {
        self.client_cert.as_ref()
    }

    /// Whether outbound requests made with this context verify the peer.
    #[must_use]
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }
}

/// Validating builder for [`SslContext`].
pub struct SslContextBuilder {
    cacerts: Vec<Cert>,
    crls: Vec<Crl>,
    private_key: Option<PrivateKey>,
    client_cert: Option<Cert>,
}

impl SslContextBuilder {
    /// Start from trust material.
    #[must_use]
    pub fn new(cacerts: Vec<Cert>, crls: Vec<Crl>) -> Self {
        Self {
            cacerts,
            crls,
            private_key: None,
            client_cert: None,
        }
    }

    /// Attach the node's key and certificate.
    #[must_use]
    pub fn with_client_credentials(mut self, key: PrivateKey, cert: Cert) -> Self {
        self.private_key = Some(key);
        self.client_cert = Some(cert);
        self
    }

    /// Validate and produce the context. Performs no I/O.
    ///
    /// Checks, in order: every CRL is issued and signed by a CA cert in
    /// the bundle; the client cert chains to the bundle within its
    /// validity window; no chain element is revoked; the private key
    /// matches the client cert's public key.
    pub fn build(self) -> Result<SslContext> {
        if self.cacerts.is_empty() {
            return Err(Error::MalformedCaCert(
                "trust bundle contains no certificates".to_string(),
            ));
        }

        for crl in &self.crls {
            self.verify_crl(crl)?;
        }

        if let Some(cert) = &self.client_cert {
            let key = self.private_key.as_ref().ok_or_else(|| {
                Error::Config("client certificate attached without a private key".to_string())
            })?;
            let chain = self.verify_chain(cert)?;
            self.verify_unrevoked(&chain)?;
            verify_key_matches(key, cert)?;
        }

        Ok(SslContext {
            cacerts: self.cacerts,
            crls: self.crls,
            private_key: self.private_key,
            client_cert: self.client_cert,
            verify_peer: true,
        })
    }

    /// Check that `crl` is issued and signed by a cert in the bundle.
    fn verify_crl(&self, crl: &Crl) -> Result<()> {
        let crl_view = crl.x509().map_err(Error::MalformedCrl)?;
        let issuer = self
            .find_issuer(crl_view.issuer().as_raw())?
            .ok_or_else(|| Error::VerificationFailed {
                subject: crl.issuer().to_string(),
                reason: "CRL is not issued by any certificate in the trust bundle".to_string(),
            })?;
        let issuer_view = issuer.x509().map_err(Error::MalformedCert)?;
        crl_view
            .verify_signature(issuer_view.public_key())
            .map_err(|e| Error::VerificationFailed {
                subject: crl.issuer().to_string(),
                reason: format!("CRL signature verification failed: {e}"),
            })
    }

    /// Walk from `cert` up to a self-signed root, verifying each link.
    /// Returns the full chain, leaf first.
    fn verify_chain<'a>(&'a self, cert: &'a Cert) -> Result<Vec<&'a Cert>> {
        let mut chain = vec![cert];
        let mut current = cert;
        for _ in 0..=self.cacerts.len() {
            let view = current.x509().map_err(Error::MalformedCert)?;
            if !view.validity().is_valid() {
                return Err(Error::VerificationFailed {
                    subject: current.subject().to_string(),
                    reason: "certificate is expired or not yet valid".to_string(),
                });
            }
            if view.subject().as_raw() == view.issuer().as_raw() {
                view.verify_signature(None)
                    .map_err(|e| Error::VerificationFailed {
                        subject: current.subject().to_string(),
                        reason: format!("self-signature verification failed: {e}"),
                    })?;
                return Ok(chain);
            }
            let issuer = self.find_issuer(view.issuer().as_raw())?.ok_or_else(|| {
                Error::VerificationFailed {
                    subject: current.subject().to_string(),
                    reason: "issuer certificate not found in the trust bundle".to_string(),
                }
            })?;
            let issuer_view = issuer.x509().map_err(Error::MalformedCert)?;
            view.verify_signature(Some(issuer_view.public_key()))
                .map_err(|e| Error::VerificationFailed {
                    subject: current.subject().to_string(),
                    reason: format!("signature verification failed: {e}"),
                })?;
            chain.push(issuer);
            current = issuer;
        }
        Err(Error::VerificationFailed {
            subject: cert.subject().to_string(),
            reason: "certificate chain does not terminate at a self-signed root".to_string(),
        })
    }

    /// Check every chain element against CRLs from its issuer.
    fn verify_unrevoked(&self, chain: &[&Cert]) -> Result<()> {
        for link in chain {
            let link_view = link.x509().map_err(Error::MalformedCert)?;
            for crl in &self.crls {
                let crl_view = crl.x509().map_err(Error::MalformedCrl)?;
                if crl_view.issuer().as_raw() != link_view.issuer().as_raw() {
                    continue;
                }
                for revoked in crl_view.iter_revoked_certificates() {
                    if revoked.user_certificate == link_view.tbs_certificate.serial {
                        return Err(Error::CertificateRevoked {
                            subject: link.subject().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn find_issuer(&self, issuer_dn: &[u8]) -> Result<Option<&Cert>> {
        for ca in &self.cacerts {
            let view = ca.x509().map_err(Error::MalformedCert)?;
            if view.subject().as_raw() == issuer_dn {
                return Ok(Some(ca));
            }
        }
        Ok(None)
    }
}

/// Compare the key's public half against the certificate's SPKI.
fn verify_key_matches(key: &PrivateKey, cert: &Cert) -> Result<()> {
    let key_spki_der = key.public_key_der()?;
    let (_, key_spki) =
        SubjectPublicKeyInfo::from_der(&key_spki_der).map_err(|e| Error::Config(format!(
            "failed to parse public key info: {e}"
        )))?;
    let cert_view = cert.x509().map_err(Error::MalformedCert)?;
    let cert_spki = cert_view.public_key();
    if cert_spki.algorithm != key_spki.algorithm
        || cert_spki.subject_public_key.data != key_spki.subject_public_key.data
    {
        return Err(Error::KeyCertMismatch {
            subject: cert.subject().to_string(),
        });
    }
    Ok(())
}
