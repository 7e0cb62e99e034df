//! HTTP interface to the certificate authority.
//!
//! [`CaClient`] is the seam between the state machine and the CA's REST
//! routes; [`HttpCaClient`] is the production implementation over a
//! blocking reqwest client. Peer verification follows the supplied
//! [`SslContext`]: the initial CA-bundle fetch runs without verification
//! (there is nothing to verify against yet), every other request pins the
//! in-memory CA bundle as its only trust roots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::Config;
use crate::context::SslContext;
use crate::error::{Error, Result};

/// Route serving the CA's own certificate bundle.
const CA_BUNDLE_PATH: &str = "/puppet-ca/v1/certificate/ca";
/// Route serving the CA's certificate revocation list.
const CRL_PATH: &str = "/puppet-ca/v1/certificate_revocation_list/ca";
/// Route accepting certificate signing requests.
const CSR_PATH: &str = "/puppet-ca/v1/certificate_request";
/// Route serving signed client certificates.
const CERT_PATH: &str = "/puppet-ca/v1/certificate";

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A CA response: status code plus raw body.
///
/// Transport failures (connection refused, TLS, timeout) are errors, not
/// responses; the caller decides what each status code means.
#[derive(Debug, Clone)]
pub struct CaResponse {
    /// HTTP status code
    pub status: u16,
    /// Raw response body
    pub body: Vec<u8>,
}

impl CaResponse {
    /// True for any 2xx status.
    #[must_use]
    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as text (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The CA routes the state machine drives.
pub trait CaClient {
    /// `GET /puppet-ca/v1/certificate/ca`
    fn get_ca_certificates(&self, ctx: &SslContext) -> Result<CaResponse>;

    /// `GET /puppet-ca/v1/certificate_revocation_list/ca`, conditionally
    /// when `if_modified_since` is set.
    fn get_crls(
        &self,
        ctx: &SslContext,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<CaResponse>;

    /// `PUT /puppet-ca/v1/certificate_request/<certname>` with a PEM body.
    fn submit_certificate_request(
        &self,
        ctx: &SslContext,
        certname: &str,
        csr_pem: &str,
    ) -> Result<CaResponse>;

    /// `GET /puppet-ca/v1/certificate/<certname>`
    fn get_certificate(&self, ctx: &SslContext, certname: &str) -> Result<CaResponse>;
}

/// Production [`CaClient`] over a blocking reqwest client.
pub struct HttpCaClient {
    base_url: String,
    timeout: Duration,
}

impl HttpCaClient {
    /// Build a client for the configured CA service.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.ca_base_url(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build a client against an explicit base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build the underlying HTTP client for the context's trust settings.
    fn client_for(&self, ctx: &SslContext) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder()
            .use_rustls_tls()
            .timeout(self.timeout)
            .user_agent(concat!("certboot/", env!("CARGO_PKG_VERSION")));

        if ctx.verify_peer() {
            builder = builder.tls_built_in_root_certs(false);
            for ca in ctx.cacerts() {
                let root = reqwest::Certificate::from_der(ca.der())
                    .map_err(|e| Error::Http(e.to_string()))?;
                builder = builder.add_root_certificate(root);
            }
        } else {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(|e| Error::Http(e.to_string()))
    }

    fn to_response(response: reqwest::blocking::Response) -> Result<CaResponse> {
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| Error::Http(e.to_string()))?
            .to_vec();
        Ok(CaResponse { status, body })
    }
}

impl CaClient for HttpCaClient {
    fn get_ca_certificates(&self, ctx: &SslContext) -> Result<CaResponse> {
        let url = format!("{}{}", self.base_url, CA_BUNDLE_PATH);
        debug!(url = %url, verify_peer = ctx.verify_peer(), "GET CA bundle");
        let response = self
            .client_for(ctx)?
            .get(&url)
            .send()
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::to_response(response)
    }

    fn get_crls(
        &self,
        ctx: &SslContext,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<CaResponse> {
        let url = format!("{}{}", self.base_url, CRL_PATH);
        debug!(url = %url, conditional = if_modified_since.is_some(), "GET CRL bundle");
        let mut request = self.client_for(ctx)?.get(&url);
        if let Some(since) = if_modified_since {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, http_date(since));
        }
        let response = request.send().map_err(|e| Error::Http(e.to_string()))?;
        Self::to_response(response)
    }

    fn submit_certificate_request(
        &self,
        ctx: &SslContext,
        certname: &str,
        csr_pem: &str,
    ) -> Result<CaResponse> {
        let url = format!("{}{}/{}", self.base_url, CSR_PATH, certname);
        debug!(url = %url, "PUT certificate request");
        let response = self
            .client_for(ctx)?
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(csr_pem.to_string())
            .send()
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::to_response(response)
    }

    fn get_certificate(&self, ctx: &SslContext, certname: &str) -> Result<CaResponse> {
        let url = format!("{}{}/{}", self.base_url, CERT_PATH, certname);
        debug!(url = %url, "GET certificate");
        let response = self
            .client_for(ctx)?
            .get(&url)
            .send()
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::to_response(response)
    }
}

/// Format a timestamp as an RFC 7231 HTTP date.
fn http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
