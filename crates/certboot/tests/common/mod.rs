//! Shared fixtures: an in-memory CA for fabricating trust material, and
//! a scripted CA client that records every request the machine makes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use certboot::{CaClient, CaResponse, Config, Error, Result, SslContext};
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DnType, IsCa,
    KeyIdMethod, KeyPair, KeyUsagePurpose, RevokedCertParams, SerialNumber,
};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

/// A throwaway CA that can issue client certificates and CRLs.
pub struct TestCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

/// A certificate issued by [`TestCa`], with the matching key.
pub struct Issued {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCa {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::default()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "Test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn issue(&self, name: &str, serial: u64) -> Issued {
        let key = KeyPair::generate().unwrap();
        let cert_pem = self.issue_with_key(name, serial, &key);
        Issued {
            cert_pem,
            key_pem: key.serialize_pem(),
        }
    }

    pub fn issue_with_key(&self, name: &str, serial: u64, key: &KeyPair) -> String {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.serial_number = Some(SerialNumber::from(serial));
        let cert = params.signed_by(key, &self.ca_cert, &self.ca_key).unwrap();
        cert.pem()
    }

    pub fn crl_pem(&self, revoked_serials: &[u64]) -> String {
        let params = CertificateRevocationListParams {
            this_update: OffsetDateTime::now_utc(),
            next_update: OffsetDateTime::now_utc() + Duration::days(30),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked_serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: OffsetDateTime::now_utc(),
                    reason_code: Some(rcgen::RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        params
            .signed_by(&self.ca_cert, &self.ca_key)
            .unwrap()
            .pem()
            .unwrap()
    }
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub route: &'static str,
    pub verify_peer: bool,
    pub conditional: bool,
}

#[derive(Default)]
struct MockInner {
    ca: VecDeque<CaResponse>,
    crl: VecDeque<CaResponse>,
    csr: VecDeque<CaResponse>,
    cert: VecDeque<CaResponse>,
    calls: Vec<Call>,
}

/// A scripted [`CaClient`]. Responses are queued per route; an
/// unscripted request fails the run with a transport error.
#[derive(Clone, Default)]
pub struct MockCaClient {
    inner: Rc<RefCell<MockInner>>,
}

impl MockCaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_ca(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.inner.borrow_mut().ca.push_back(response(status, body));
    }

    pub fn script_crl(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.inner.borrow_mut().crl.push_back(response(status, body));
    }

    pub fn script_csr(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.inner.borrow_mut().csr.push_back(response(status, body));
    }

    pub fn script_cert(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.inner
            .borrow_mut()
            .cert
            .push_back(response(status, body));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.borrow().calls.clone()
    }

    pub fn calls_for(&self, route: &str) -> usize {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter(|c| c.route == route)
            .count()
    }

    fn record_and_pop(
        &self,
        route: &'static str,
        verify_peer: bool,
        conditional: bool,
    ) -> Result<CaResponse> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push(Call {
            route,
            verify_peer,
            conditional,
        });
        let queue = match route {
            "ca" => &mut inner.ca,
            "crl" => &mut inner.crl,
            "csr" => &mut inner.csr,
            _ => &mut inner.cert,
        };
        queue
            .pop_front()
            .ok_or_else(|| Error::Http(format!("unscripted {route} request")))
    }
}

fn response(status: u16, body: impl Into<Vec<u8>>) -> CaResponse {
    CaResponse {
        status,
        body: body.into(),
    }
}

impl CaClient for MockCaClient {
    fn get_ca_certificates(&self, ctx: &SslContext) -> Result<CaResponse> {
        self.record_and_pop("ca", ctx.verify_peer(), false)
    }

    fn get_crls(
        &self,
        ctx: &SslContext,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<CaResponse> {
        self.record_and_pop("crl", ctx.verify_peer(), if_modified_since.is_some())
    }

    fn submit_certificate_request(
        &self,
        ctx: &SslContext,
        _certname: &str,
        _csr_pem: &str,
    ) -> Result<CaResponse> {
        self.record_and_pop("csr", ctx.verify_peer(), false)
    }

    fn get_certificate(&self, ctx: &SslContext, _certname: &str) -> Result<CaResponse> {
        self.record_and_pop("cert", ctx.verify_peer(), false)
    }
}

/// Config rooted in a temp dir, with fast polling for tests that wait.
pub fn test_config(dir: &TempDir, certname: &str) -> Config {
    let mut config = Config::new(certname);
    config.ssldir = dir.path().to_path_buf();
    config.waitforcert = 1;
    config
}
