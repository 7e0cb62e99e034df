//! Bootstrap configuration.
//!
//! Settings load from a TOML file with serde defaults; the CLI layers
//! flag and environment overrides on top. All persistence paths derive
//! from `ssldir` unless individually overridden.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::KeyType;

/// Whether certificate revocation is checked during chain validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationMode {
    /// No CRLs are fetched or consulted
    Off,
    /// Every certificate in the client chain is checked
    #[default]
    Chain,
}

/// A parsed subject-alternative-name entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    /// `DNS:` entry (the default for bare names)
    Dns(String),
    /// `IP:` entry
    Ip(IpAddr),
}

/// Configuration for a bootstrap run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The node's identity: CSR subject CN and CA URL path element.
    pub certname: String,

    /// CA server hostname.
    #[serde(default = "default_server")]
    pub server: String,

    /// CA server port.
    #[serde(default = "default_ca_port")]
    pub ca_port: u16,

    /// Key algorithm for newly generated keys.
    #[serde(default)]
    pub key_type: KeyType,

    /// Named curve for EC keys.
    #[serde(default = "default_named_curve")]
    pub named_curve: String,

    /// Comma-separated subject alternative names. Entries may carry a
    /// `DNS:` or `IP:` prefix; bare entries default to `DNS:`.
    #[serde(default)]
    pub dns_alt_names: String,

    /// Path to a TOML file supplying CSR attributes and extension requests.
    #[serde(default)]
    pub csr_attributes_path: Option<PathBuf>,

    /// Revocation checking mode.
    #[serde(default)]
    pub certificate_revocation: RevocationMode,

    /// Re-fetch the CRL only if the local copy is at least this old (seconds).
    #[serde(default = "default_crl_refresh_interval")]
    pub crl_refresh_interval: u64,

    /// Seconds between poll attempts while the certificate is unsigned.
    /// `0` exits immediately instead of polling.
    #[serde(default = "default_waitforcert")]
    pub waitforcert: u64,

    /// Wall-clock ceiling on total waiting, in seconds. Absent means wait
    /// forever.
    #[serde(default)]
    pub maxwaitforcert: Option<u64>,

    /// Directory holding all persisted SSL state.
    #[serde(default = "default_ssldir")]
    pub ssldir: PathBuf,

    /// Override for the CA bundle path.
    #[serde(default)]
    pub cacert_path: Option<PathBuf>,

    /// Override for the CRL bundle path.
    #[serde(default)]
    pub crl_path: Option<PathBuf>,

    /// Override for the private key path.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Override for the client certificate path.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    /// Override for the saved CSR path.
    #[serde(default)]
    pub csr_path: Option<PathBuf>,

    /// Override for the lock file path.
    #[serde(default)]
    pub lock_path: Option<PathBuf>,
}

impl Config {
    /// Build a configuration with defaults for the given certname.
    #[must_use]
    pub fn new(certname: impl Into<String>) -> Self {
        Self {
            certname: certname.into(),
            server: default_server(),
            ca_port: default_ca_port(),
            key_type: KeyType::default(),
            named_curve: default_named_curve(),
            dns_alt_names: String::new(),
            csr_attributes_path: None,
            certificate_revocation: RevocationMode::default(),
            crl_refresh_interval: default_crl_refresh_interval(),
            waitforcert: default_waitforcert(),
            maxwaitforcert: None,
            ssldir: default_ssldir(),
            cacert_path: None,
            crl_path: None,
            private_key_path: None,
            client_cert_path: None,
            csr_path: None,
            lock_path: None,
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Base URL of the CA service.
    #[must_use]
    pub fn ca_base_url(&self) -> String {
        format!("https://{}:{}", self.server, self.ca_port)
    }

    /// Path of the persisted CA bundle.
    #[must_use]
    pub fn cacert_path(&self) -> PathBuf {
        self.cacert_path
            .clone()
            .unwrap_or_else(|| self.ssldir.join("certs").join("ca.pem"))
    }

    /// Path of the persisted CRL bundle.
    #[must_use]
    pub fn crl_path(&self) -> PathBuf {
        self.crl_path
            .clone()
            .unwrap_or_else(|| self.ssldir.join("crl.pem"))
    }

    /// Path of the node's private key.
    #[must_use]
    pub fn private_key_path(&self) -> PathBuf {
        self.private_key_path.clone().unwrap_or_else(|| {
            self.ssldir
                .join("private_keys")
                .join(format!("{}.pem", self.certname))
        })
    }

    /// Path of the node's client certificate.
    #[must_use]
    pub fn client_cert_path(&self) -> PathBuf {
        self.client_cert_path.clone().unwrap_or_else(|| {
            self.ssldir
                .join("certs")
                .join(format!("{}.pem", self.certname))
        })
    }

    /// Path of the saved certificate signing request.
    #[must_use]
    pub fn csr_path(&self) -> PathBuf {
        self.csr_path.clone().unwrap_or_else(|| {
            self.ssldir
                .join("certificate_requests")
                .join(format!("{}.pem", self.certname))
        })
    }

    /// Path of the bootstrap lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| self.ssldir.join("ssl.lock"))
    }

    /// Parse `dns_alt_names` into SAN entries, appending the certname as a
    /// `DNS:` entry when it is not already listed.
    pub fn alt_names(&self) -> Result<Vec<AltName>> {
        let mut names = Vec::new();
        for raw in self.dns_alt_names.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }
            let name = parse_alt_name(entry)?;
            if !names.contains(&name) {
                names.push(name);
            }
        }
        let certname = AltName::Dns(self.certname.clone());
        if !names.contains(&certname) {
            names.push(certname);
        }
        Ok(names)
    }

    /// Load the CSR attributes file, or defaults when none is configured.
    pub fn csr_attributes(&self) -> Result<CsrAttributes> {
        match &self.csr_attributes_path {
            Some(path) => CsrAttributes::load(path),
            None => Ok(CsrAttributes::default()),
        }
    }
}

fn parse_alt_name(entry: &str) -> Result<AltName> {
    if let Some(rest) = entry.strip_prefix("IP:") {
        let addr: IpAddr = rest
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid IP alt name: {rest}")))?;
        Ok(AltName::Ip(addr))
    } else if let Some(rest) = entry.strip_prefix("DNS:") {
        Ok(AltName::Dns(rest.trim().to_string()))
    } else {
        Ok(AltName::Dns(entry.to_string()))
    }
}

/// Attributes and extension requests added to the CSR, keyed by dotted
/// OID strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsrAttributes {
    /// Attributes placed in the CSR attribute set (OID -> string value).
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, String>,

    /// Extensions requested from the CA (OID -> string value).
    #[serde(default)]
    pub extension_requests: BTreeMap<String, String>,
}

impl CsrAttributes {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }
}

// Default value functions for serde.
fn default_server() -> String {
    String::from("puppet")
}

const fn default_ca_port() -> u16 {
    8140
}

fn default_named_curve() -> String {
    String::from("prime256v1")
}

const fn default_crl_refresh_interval() -> u64 {
    86_400
}

const fn default_waitforcert() -> u64 {
    120
}

fn default_ssldir() -> PathBuf {
    directories::ProjectDirs::from("org", "certboot", "certboot")
        .map(|dirs| dirs.data_dir().join("ssl"))
        .unwrap_or_else(|| PathBuf::from(".certboot/ssl"))
}
