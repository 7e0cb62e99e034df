//! # certboot
//!
//! Client-side SSL bootstrap: bring a node from "no local credentials" to
//! "holding a validated private key, signed client certificate, and
//! verified trust material", talking to a certificate authority over HTTP.
//!
//! ## Data Flow
//!
//! ```text
//! ensure_client_certificate()
//!   acquire lock
//!   -> NeedCACerts   load or GET /certificate/ca (verification OFF, first fetch only)
//!   -> NeedCRLs      load, GET, or conditionally refresh the CRL bundle
//!   -> NeedKey       load or generate the private key (RSA 4096 / EC)
//!   -> NeedSubmitCSR persist then PUT /certificate_request/<certname>
//!   -> NeedCert      GET /certificate/<certname>, validate, persist
//!   -> Done          SslContext { cacerts, crls, key, cert }
//!   release lock
//! ```
//!
//! The machine is deliberately restartable: everything persisted is
//! reloaded and revalidated on the next run, so a run performs only the
//! work that is still missing. A fully provisioned node performs no HTTP
//! at all.
//!
//! ## Failure policy
//!
//! Three classes of failure coexist and are never collapsed:
//! - **fatal**: missing or malformed trust material, an unreadable key,
//!   a rejected CSR. Surfaced to the caller.
//! - **tolerated**: every failure mode of a CRL *refresh*. Stale CRLs
//!   beat no trust; the local copy stays in use.
//! - **wait**: a certificate the CA has not signed yet (or signed
//!   unusably). Logged, then retried after `waitforcert` seconds.
//!
//! ## Example
//!
//! ```rust,ignore
//! use certboot::{Config, CertProvider, HttpCaClient, StateMachine};
//!
//! let config = Config::new("agent01.example.com");
//! let provider = CertProvider::from_config(&config);
//! let ca = HttpCaClient::new(&config);
//! let machine = StateMachine::new(config, provider, ca);
//! let ssl_context = machine.ensure_client_certificate()?;
//! ```

pub mod cert;
pub mod config;
pub mod context;
pub mod csr;
pub mod error;
pub mod http;
pub mod key;
pub mod lockfile;
pub mod machine;
pub mod provider;

pub use cert::{Cert, Crl};
pub use config::{Config, CsrAttributes, RevocationMode};
pub use context::{SslContext, SslContextBuilder};
pub use error::{Error, Result};
pub use http::{CaClient, CaResponse, HttpCaClient};
pub use key::{KeyType, PrivateKey};
pub use lockfile::LockFile;
pub use machine::{State, StateMachine};
pub use provider::CertProvider;
