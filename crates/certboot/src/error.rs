//! Error types for the bootstrap state machine.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bootstrapping SSL credentials
#[derive(Error, Debug)]
pub enum Error {
    /// Another bootstrap process holds the lock file
    #[error("another instance is already running (pid {pid}, lock file {})", path.display())]
    AnotherInstanceRunning {
        /// PID recorded in the lock file
        pid: u32,
        /// Location of the lock file
        path: PathBuf,
    },

    /// The CA answered 404 for its own certificate bundle
    #[error("the CA certificate is missing from the server")]
    CaCertMissing,

    /// The CA bundle download failed with an unexpected status
    #[error("failed to download CA certificates: {status} {reason}")]
    CaCertDownloadFailed {
        /// HTTP status code
        status: u16,
        /// Response body or status reason
        reason: String,
    },

    /// A CA bundle (downloaded or on disk) could not be parsed
    #[error("malformed CA certificate bundle: {0}")]
    MalformedCaCert(String),

    /// A certificate other than the CA bundle could not be parsed
    #[error("malformed certificate: {0}")]
    MalformedCert(String),

    /// The CA answered 404 for its certificate revocation list
    #[error("the certificate revocation list is missing from the server")]
    CrlMissing,

    /// The CRL bundle download failed with an unexpected status
    #[error("failed to download certificate revocation list: {status} {reason}")]
    CrlDownloadFailed {
        /// HTTP status code
        status: u16,
        /// Response body or status reason
        reason: String,
    },

    /// A CRL bundle (downloaded or on disk) could not be parsed
    #[error("malformed certificate revocation list: {0}")]
    MalformedCrl(String),

    /// The configured EC curve is not supported
    #[error("unsupported elliptic curve: {0}")]
    UnsupportedCurve(String),

    /// The on-disk private key could not be loaded
    #[error("failed to load private key {}: {reason}", path.display())]
    KeyLoadFailed {
        /// Path of the key file
        path: PathBuf,
        /// Why the key could not be parsed
        reason: String,
    },

    /// The private key's public part differs from the certificate's
    #[error("the private key does not match the certificate {subject}")]
    KeyCertMismatch {
        /// Subject of the mismatched certificate
        subject: String,
    },

    /// A certificate in the client chain appears in a CRL
    #[error("certificate {subject} is revoked")]
    CertificateRevoked {
        /// Subject of the revoked certificate
        subject: String,
    },

    /// A certificate or CRL failed chain or signature verification
    #[error("failed to verify {subject}: {reason}")]
    VerificationFailed {
        /// Subject of the offending certificate or CRL issuer
        subject: String,
        /// Why verification failed
        reason: String,
    },

    /// The CA rejected the certificate signing request
    #[error("failed to submit certificate request: {status} {reason}")]
    CsrSubmitFailed {
        /// HTTP status code
        status: u16,
        /// Response body or status reason
        reason: String,
    },

    /// Building or signing the certificate signing request failed
    #[error("failed to build certificate request: {0}")]
    CsrBuildFailed(String),

    /// Gave up waiting for the CA to sign our certificate
    #[error("{0}")]
    WaitForCertTimeout(WaitTimeout),

    /// HTTP transport failure (connection, TLS, timeout)
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Configuration is invalid or missing required fields
    #[error("configuration error: {0}")]
    Config(String),

    /// File read/write failed
    #[error("{}: {source}", path.display())]
    Io {
        /// Path involved in the failed operation
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why the machine stopped waiting for a signed certificate.
///
/// Both cases terminate the process; `Display` produces the exact
/// message printed to stdout before exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTimeout {
    /// `waitforcert` is 0, so we never poll
    ZeroWait {
        /// The agent's certname
        certname: String,
    },
    /// Total waiting passed the `maxwaitforcert` ceiling
    DeadlineExceeded {
        /// The agent's certname
        certname: String,
    },
}

impl std::fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroWait { certname } => write!(
                f,
                "Couldn't fetch certificate from CA server; you might still need to sign this \
                 agent's certificate ({certname}). Exiting now because the waitforcert setting \
                 is set to 0."
            ),
            Self::DeadlineExceeded { certname } => write!(
                f,
                "Couldn't fetch certificate from CA server; you might still need to sign this \
                 agent's certificate ({certname}). Exiting now because the maxwaitforcert \
                 timeout has been exceeded."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_messages() {
        let zero = WaitTimeout::ZeroWait {
            certname: "node1".into(),
        };
        assert!(zero.to_string().contains("(node1)"));
        assert!(zero.to_string().contains("waitforcert setting is set to 0"));

        let deadline = WaitTimeout::DeadlineExceeded {
            certname: "node1".into(),
        };
        assert!(deadline.to_string().contains("maxwaitforcert timeout has been exceeded"));
    }

    #[test]
    fn io_error_includes_path() {
        let err = Error::io(
            "/tmp/ssl/ca.pem",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/ssl/ca.pem"));
    }
}
