//! On-disk persistence of SSL artifacts.
//!
//! Everything is stored as UTF-8 PEM under the configured paths. Loads
//! return `Ok(None)` when a file is absent and an error when a file
//! exists but cannot be parsed; a malformed artifact on disk is never
//! silently ignored. The CRL bundle's mtime doubles as its last-update
//! timestamp.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cert::{self, Cert, Crl};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::PrivateKey;

/// Loads and saves the persisted SSL artifacts.
#[derive(Debug, Clone)]
pub struct CertProvider {
    cacert_path: PathBuf,
    crl_path: PathBuf,
    private_key_path: PathBuf,
    client_cert_path: PathBuf,
    csr_path: PathBuf,
}

impl CertProvider {
    /// Derive all artifact paths from the configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            cacert_path: config.cacert_path(),
            crl_path: config.crl_path(),
            private_key_path: config.private_key_path(),
            client_cert_path: config.client_cert_path(),
            csr_path: config.csr_path(),
        }
    }

    /// Load the CA bundle, if present.
    pub fn load_cacerts(&self) -> Result<Option<Vec<Cert>>> {
        match read_optional(&self.cacert_path)? {
            None => Ok(None),
            Some(data) => cert::parse_cert_bundle(&data)
                .map(Some)
                .map_err(|reason| {
                    Error::MalformedCaCert(format!("{}: {reason}", self.cacert_path.display()))
                }),
        }
    }

    /// Persist the CA bundle.
    pub fn save_cacerts(&self, cacerts: &[Cert]) -> Result<()> {
        debug!(path = %self.cacert_path.display(), count = cacerts.len(), "saving CA bundle");
        write_file(&self.cacert_path, cert::cert_bundle_to_pem(cacerts).as_bytes())
    }

    /// Load the CRL bundle and its last-update timestamp, if present.
    pub fn load_crls(&self) -> Result<Option<(Vec<Crl>, DateTime<Utc>)>> {
        match read_optional(&self.crl_path)? {
            None => Ok(None),
            Some(data) => {
                let crls = cert::parse_crl_bundle(&data).map_err(|reason| {
                    Error::MalformedCrl(format!("{}: {reason}", self.crl_path.display()))
                })?;
                let last_update = self.crl_last_update()?;
                Ok(Some((crls, last_update)))
            }
        }
    }

    /// Persist the CRL bundle, bumping its last-update timestamp.
    pub fn save_crls(&self, crls: &[Crl]) -> Result<()> {
        debug!(path = %self.crl_path.display(), count = crls.len(), "saving CRL bundle");
        write_file(&self.crl_path, cert::crl_bundle_to_pem(crls).as_bytes())
    }

    /// Last-update timestamp of the CRL bundle (its file mtime).
    pub fn crl_last_update(&self) -> Result<DateTime<Utc>> {
        let meta = fs::metadata(&self.crl_path).map_err(|e| Error::io(&self.crl_path, e))?;
        let mtime = meta.modified().map_err(|e| Error::io(&self.crl_path, e))?;
        Ok(DateTime::<Utc>::from(mtime))
    }

    /// Load the node's private key, if present.
    ///
    /// A key that exists but cannot be parsed is a hard error; it is
    /// never regenerated.
    pub fn load_private_key(&self) -> Result<Option<PrivateKey>> {
        match read_optional(&self.private_key_path)? {
            None => Ok(None),
            Some(data) => {
                let text = String::from_utf8(data).map_err(|_| Error::KeyLoadFailed {
                    path: self.private_key_path.clone(),
                    reason: "file is not valid UTF-8".to_string(),
                })?;
                PrivateKey::from_pem(&text)
                    .map(Some)
                    .map_err(|reason| Error::KeyLoadFailed {
                        path: self.private_key_path.clone(),
                        reason,
                    })
            }
        }
    }

    /// Persist the node's private key with owner-only permissions.
    pub fn save_private_key(&self, key: &PrivateKey) -> Result<()> {
        debug!(path = %self.private_key_path.display(), "saving private key");
        write_file(&self.private_key_path, key.to_pkcs8_pem()?.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.private_key_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::io(&self.private_key_path, e))?;
        }
        Ok(())
    }

    /// Load the node's client certificate, if present.
    pub fn load_client_cert(&self) -> Result<Option<Cert>> {
        match read_optional(&self.client_cert_path)? {
            None => Ok(None),
            Some(data) => Cert::from_pem(&data).map(Some).map_err(|reason| {
                Error::MalformedCert(format!(
                    "{}: {reason}",
                    self.client_cert_path.display()
                ))
            }),
        }
    }

    /// Persist the node's client certificate.
    pub fn save_client_cert(&self, certname: &str, cert: &Cert) -> Result<()> {
        debug!(certname, path = %self.client_cert_path.display(), "saving client certificate");
        write_file(&self.client_cert_path, cert.to_pem().as_bytes())
    }

    /// Persist the certificate signing request.
    pub fn save_request(&self, certname: &str, csr_pem: &str) -> Result<()> {
        debug!(certname, path = %self.csr_path.display(), "saving certificate request");
        write_file(&self.csr_path, csr_pem.as_bytes())
    }

    /// Load the saved certificate signing request, if present.
    pub fn load_request(&self) -> Result<Option<String>> {
        match read_optional(&self.csr_path)? {
            None => Ok(None),
            Some(data) => String::from_utf8(data).map(Some).map_err(|_| {
                Error::Config(format!(
                    "{}: saved request is not valid UTF-8",
                    self.csr_path.display()
                ))
            }),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, data).map_err(|e| Error::io(path, e))
}
