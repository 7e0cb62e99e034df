//! End-to-end state machine tests against a scripted CA.

mod common;

use std::fs;

use certboot::cert::{parse_cert_bundle, parse_crl_bundle};
use certboot::{CertProvider, Config, Error, PrivateKey, RevocationMode, StateMachine};
use common::{test_config, MockCaClient, TestCa};
use tempfile::TempDir;

fn machine(config: &Config, mock: &MockCaClient) -> StateMachine<MockCaClient> {
    StateMachine::new(
        config.clone(),
        CertProvider::from_config(config),
        mock.clone(),
    )
}

fn seed_trust(config: &Config, ca: &TestCa, revoked: &[u64]) {
    let provider = CertProvider::from_config(config);
    provider
        .save_cacerts(&parse_cert_bundle(ca.ca_pem().as_bytes()).unwrap())
        .unwrap();
    provider
        .save_crls(&parse_crl_bundle(ca.crl_pem(revoked).as_bytes()).unwrap())
        .unwrap();
}

fn seed_key(config: &Config, key_pem: &str) {
    CertProvider::from_config(config)
        .save_private_key(&PrivateKey::from_pem(key_pem).unwrap())
        .unwrap();
}

#[test]
fn trust_from_local_state_performs_no_http() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);

    let mock = MockCaClient::new();
    let ctx = machine(&config, &mock).ensure_ca_certificates().unwrap();

    assert_eq!(ctx.cacerts().len(), 1);
    assert_eq!(ctx.crls().len(), 1);
    assert!(ctx.verify_peer());
    assert!(mock.calls().is_empty());
}

#[test]
fn trust_downloads_and_persists_bundles() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();

    let mock = MockCaClient::new();
    mock.script_ca(200, ca.ca_pem());
    mock.script_crl(200, ca.crl_pem(&[]));

    let ctx = machine(&config, &mock).ensure_ca_certificates().unwrap();
    assert_eq!(ctx.cacerts().len(), 1);
    assert_eq!(ctx.crls().len(), 1);

    // Both bundles hit disk and reparse
    assert_eq!(
        parse_cert_bundle(&fs::read(config.cacert_path()).unwrap())
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        parse_crl_bundle(&fs::read(config.crl_path()).unwrap())
            .unwrap()
            .len(),
        1
    );

    // The first fetch runs unverified; everything after is verified
    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].route, "ca");
    assert!(!calls[0].verify_peer);
    assert_eq!(calls[1].route, "crl");
    assert!(calls[1].verify_peer);
    assert!(!calls[1].conditional);
}

#[test]
fn stale_pid_lock_is_reclaimed_and_removed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);

    // Maximum possible PID: guaranteed dead
    fs::write(config.lock_path(), "2147483647").unwrap();

    let mock = MockCaClient::new();
    machine(&config, &mock).ensure_ca_certificates().unwrap();
    assert!(!config.lock_path().exists());
}

#[test]
fn live_foreign_lock_refuses_to_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);

    // PID 1 always exists
    fs::write(config.lock_path(), "1").unwrap();

    let mock = MockCaClient::new();
    let err = machine(&config, &mock)
        .ensure_ca_certificates()
        .unwrap_err();
    assert!(matches!(err, Error::AnotherInstanceRunning { pid: 1, .. }));
    // The foreign lock is left untouched
    assert_eq!(fs::read_to_string(config.lock_path()).unwrap(), "1");
}

#[test]
fn lock_is_removed_after_fatal_errors() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");

    let mock = MockCaClient::new();
    mock.script_ca(404, "");
    let err = machine(&config, &mock)
        .ensure_ca_certificates()
        .unwrap_err();
    assert!(matches!(err, Error::CaCertMissing));
    assert!(!config.lock_path().exists());
}

#[test]
fn ca_download_failure_statuses() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");

    let mock = MockCaClient::new();
    mock.script_ca(500, "boom");
    let err = machine(&config, &mock)
        .ensure_ca_certificates()
        .unwrap_err();
    assert!(matches!(err, Error::CaCertDownloadFailed { status: 500, .. }));
}

#[test]
fn malformed_ca_body_is_fatal_and_not_persisted() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");

    let mock = MockCaClient::new();
    mock.script_ca(200, "this is not pem");
    let err = machine(&config, &mock)
        .ensure_ca_certificates()
        .unwrap_err();
    assert!(matches!(err, Error::MalformedCaCert(_)));
    assert!(!config.cacert_path().exists());
}

#[test]
fn missing_crl_is_fatal_on_fresh_fetch() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();

    let mock = MockCaClient::new();
    mock.script_ca(200, ca.ca_pem());
    mock.script_crl(404, "");
    let err = machine(&config, &mock)
        .ensure_ca_certificates()
        .unwrap_err();
    assert!(matches!(err, Error::CrlMissing));
}

#[test]
fn malformed_fresh_crl_is_fatal_and_not_persisted() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();

    let mock = MockCaClient::new();
    mock.script_ca(200, ca.ca_pem());
    mock.script_crl(200, "garbage");
    let err = machine(&config, &mock)
        .ensure_ca_certificates()
        .unwrap_err();
    assert!(matches!(err, Error::MalformedCrl(_)));
    assert!(!config.crl_path().exists());
}

#[test]
fn failed_crl_refresh_keeps_local_copy() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, "node1");
    config.crl_refresh_interval = 0; // local copy is always considered stale
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);
    let before = fs::read(config.crl_path()).unwrap();

    let mock = MockCaClient::new();
    mock.script_crl(503, "service unavailable");
    let ctx = machine(&config, &mock).ensure_ca_certificates().unwrap();

    assert_eq!(ctx.crls().len(), 1);
    assert_eq!(fs::read(config.crl_path()).unwrap(), before);
    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].route, "crl");
    assert!(calls[0].conditional);
}

#[test]
fn not_modified_crl_refresh_keeps_local_copy() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, "node1");
    config.crl_refresh_interval = 0;
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);
    let before = fs::read(config.crl_path()).unwrap();

    let mock = MockCaClient::new();
    mock.script_crl(304, "");
    machine(&config, &mock).ensure_ca_certificates().unwrap();
    assert_eq!(fs::read(config.crl_path()).unwrap(), before);
}

#[test]
fn successful_crl_refresh_replaces_local_copy() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, "node1");
    config.crl_refresh_interval = 0;
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);
    let before = fs::read(config.crl_path()).unwrap();

    let mock = MockCaClient::new();
    mock.script_crl(200, ca.crl_pem(&[99]));
    machine(&config, &mock).ensure_ca_certificates().unwrap();

    let after = fs::read(config.crl_path()).unwrap();
    assert_ne!(after, before);
    assert_eq!(parse_crl_bundle(&after).unwrap().len(), 1);
}

#[test]
fn revocation_off_skips_crls_entirely() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, "node1");
    config.certificate_revocation = RevocationMode::Off;
    let ca = TestCa::new();
    CertProvider::from_config(&config)
        .save_cacerts(&parse_cert_bundle(ca.ca_pem().as_bytes()).unwrap())
        .unwrap();

    let mock = MockCaClient::new();
    let ctx = machine(&config, &mock).ensure_ca_certificates().unwrap();

    assert!(ctx.crls().is_empty());
    assert!(!config.crl_path().exists());
    assert!(mock.calls().is_empty());
}

#[test]
fn full_bootstrap_then_idempotent_second_run() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, "node1");
    config.dns_alt_names = String::from("one,IP:192.168.0.1");
    let ca = TestCa::new();
    let issued = ca.issue("node1", 42);
    seed_key(&config, &issued.key_pem);

    let mock = MockCaClient::new();
    mock.script_ca(200, ca.ca_pem());
    mock.script_crl(200, ca.crl_pem(&[]));
    mock.script_csr(200, "");
    mock.script_cert(200, issued.cert_pem.clone());

    let ctx = machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap();
    assert!(ctx.client_cert().unwrap().subject().contains("node1"));
    assert!(ctx.private_key().is_some());

    // All four artifacts are on disk; only the first request was unverified
    assert!(config.client_cert_path().exists());
    assert!(config.csr_path().exists());
    let calls = mock.calls();
    assert_eq!(calls.len(), 4);
    assert!(!calls[0].verify_peer);
    assert!(calls.iter().skip(1).all(|c| c.verify_peer));

    // The saved CSR reparses with the configured SANs
    let csr_file = fs::read(config.csr_path()).unwrap();
    let block = ::pem::parse(&csr_file).unwrap();
    use x509_parser::prelude::*;
    let (_, csr) = X509CertificationRequest::from_der(block.contents()).unwrap();
    csr.verify_signature().unwrap();
    let mut sans = Vec::new();
    for ext in csr.requested_extensions().unwrap() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext {
            for name in &san.general_names {
                sans.push(format!("{name:?}"));
            }
        }
    }
    assert_eq!(sans.len(), 3, "one, 192.168.0.1, and the certname");

    // Second run: everything loads from disk, nothing is fetched or
    // rewritten
    let snapshot = |cfg: &Config| {
        (
            fs::read(cfg.cacert_path()).unwrap(),
            fs::read(cfg.crl_path()).unwrap(),
            fs::read(cfg.private_key_path()).unwrap(),
            fs::read(cfg.client_cert_path()).unwrap(),
        )
    };
    let before = snapshot(&config);

    let idle_mock = MockCaClient::new();
    let ctx2 = machine(&config, &idle_mock)
        .ensure_client_certificate()
        .unwrap();

    assert!(idle_mock.calls().is_empty());
    assert_eq!(snapshot(&config), before);
    assert_eq!(
        ctx2.client_cert().unwrap().fingerprint(),
        ctx.client_cert().unwrap().fingerprint()
    );
    assert!(!config.lock_path().exists());
}

#[test]
fn mismatched_cert_on_disk_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);

    let ours = ca.issue("node1", 1);
    let theirs = ca.issue("other", 2);
    seed_key(&config, &ours.key_pem);
    fs::create_dir_all(config.client_cert_path().parent().unwrap()).unwrap();
    fs::write(config.client_cert_path(), &theirs.cert_pem).unwrap();

    let mock = MockCaClient::new();
    let err = machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap_err();
    assert!(matches!(err, Error::KeyCertMismatch { subject } if subject.contains("other")));
}

#[test]
fn mismatched_cert_from_ca_waits_and_retries() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);

    let key = rcgen::KeyPair::generate().unwrap();
    let good_pem = ca.issue_with_key("node1", 7, &key);
    let mismatched = ca.issue("node1", 8); // different keypair
    seed_key(&config, &key.serialize_pem());

    let mock = MockCaClient::new();
    mock.script_csr(200, "");
    mock.script_cert(200, mismatched.cert_pem);
    // Second cycle after the wait: the CA reports the request as known
    mock.script_csr(400, "node1 already has a requested certificate");
    mock.script_cert(200, good_pem.clone());

    let ctx = machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap();

    assert_eq!(mock.calls_for("csr"), 2);
    assert_eq!(mock.calls_for("cert"), 2);
    let saved = fs::read_to_string(config.client_cert_path()).unwrap();
    let saved_cert = certboot::Cert::from_pem(saved.as_bytes()).unwrap();
    let good_cert = certboot::Cert::from_pem(good_pem.as_bytes()).unwrap();
    assert_eq!(saved_cert.fingerprint(), good_cert.fingerprint());
    assert_eq!(
        ctx.client_cert().unwrap().fingerprint(),
        good_cert.fingerprint()
    );
}

#[test]
fn revoked_cert_from_ca_waits_and_retries() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    // Serial 66 is revoked from the start
    seed_trust(&config, &ca, &[66]);

    let key = rcgen::KeyPair::generate().unwrap();
    let revoked_pem = ca.issue_with_key("node1", 66, &key);
    let good_pem = ca.issue_with_key("node1", 77, &key);
    seed_key(&config, &key.serialize_pem());

    let mock = MockCaClient::new();
    mock.script_csr(200, "");
    mock.script_cert(200, revoked_pem);
    mock.script_csr(400, "node1 already has a signed certificate");
    mock.script_cert(200, good_pem);

    let ctx = machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap();
    assert_eq!(mock.calls_for("cert"), 2);
    assert!(ctx.client_cert().is_some());
}

#[test]
fn unsigned_cert_waits_and_retries() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);
    let issued = ca.issue("node1", 5);
    seed_key(&config, &issued.key_pem);

    let mock = MockCaClient::new();
    mock.script_csr(200, "");
    mock.script_cert(404, "not signed yet");
    mock.script_csr(400, "node1 already has a requested certificate");
    mock.script_cert(200, issued.cert_pem);

    machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap();
    assert_eq!(mock.calls_for("cert"), 2);
}

#[test]
fn malformed_cert_body_waits_and_retries() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);
    let issued = ca.issue("node1", 5);
    seed_key(&config, &issued.key_pem);

    let mock = MockCaClient::new();
    mock.script_csr(200, "");
    mock.script_cert(200, "mangled pem");
    mock.script_csr(400, "node1 already has a requested certificate");
    mock.script_cert(200, issued.cert_pem);

    machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap();
    assert_eq!(mock.calls_for("cert"), 2);
}

#[test]
fn hard_csr_rejection_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "node1");
    let ca = TestCa::new();
    seed_trust(&config, &ca, &[]);
    let issued = ca.issue("node1", 5);
    seed_key(&config, &issued.key_pem);

    let mock = MockCaClient::new();
    mock.script_csr(400, "the CSR is badly formed");

    let err = machine(&config, &mock)
        .ensure_client_certificate()
        .unwrap_err();
    assert!(matches!(err, Error::CsrSubmitFailed { status: 400, .. }));
    // The request was still persisted before submission
    assert!(config.csr_path().exists());
}
