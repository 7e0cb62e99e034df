//! The bootstrap state machine.
//!
//! A run walks a fixed progression of states, each transition loading or
//! fetching one piece of credential material and enriching the
//! [`SslContext`] carried forward:
//!
//! ```text
//! NeedCACerts -> NeedCRLs -> NeedKey -> NeedSubmitCSR -> NeedCert -> Done
//!      ^                        |                           |
//!      |                        +--> Done (cert on disk)    v
//!      +------------------------------------------------- Wait
//! ```
//!
//! Everything on disk is reused; only the missing pieces touch the CA.
//! `Wait` restarts the whole cycle so trust material may change while we
//! poll for a signature.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::cert::{self, Cert};
use crate::config::{Config, RevocationMode};
use crate::context::{SslContext, SslContextBuilder};
use crate::csr;
use crate::error::{Error, Result, WaitTimeout};
use crate::http::CaClient;
use crate::key::PrivateKey;
use crate::lockfile::LockFile;
use crate::provider::CertProvider;

/// 400 bodies that mean the CA already holds a request for this name.
const CSR_ALREADY_PHRASES: &[&str] = &[
    "already has a requested certificate",
    "already has a signed certificate",
    "already has a revoked certificate",
];

/// A point in the bootstrap progression, carrying everything gathered
/// so far.
#[derive(Debug)]
pub enum State {
    /// Load or download the CA bundle.
    NeedCaCerts,
    /// Load, download or refresh the CRL bundle.
    NeedCrls(SslContext),
    /// Load or generate the private key; detect an existing certificate.
    NeedKey(SslContext),
    /// Build, persist and submit the certificate signing request.
    NeedSubmitCsr {
        /// Trust material gathered so far
        ssl_context: SslContext,
        /// The node's private key
        key: PrivateKey,
    },
    /// Poll the CA for our signed certificate.
    NeedCert {
        /// Trust material gathered so far
        ssl_context: SslContext,
        /// The node's private key
        key: PrivateKey,
    },
    /// The certificate is not ready; sleep or give up.
    Wait(SslContext),
    /// Terminal: the context holds validated key, cert and trust chain.
    Done(SslContext),
}

impl State {
    /// Variant name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NeedCaCerts => "NeedCACerts",
            Self::NeedCrls(_) => "NeedCRLs",
            Self::NeedKey(_) => "NeedKey",
            Self::NeedSubmitCsr { .. } => "NeedSubmitCSR",
            Self::NeedCert { .. } => "NeedCert",
            Self::Wait(_) => "Wait",
            Self::Done(_) => "Done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Stop once trust material (CA certs + CRLs) is assembled.
    TrustOnly,
    /// Run to `Done`.
    ClientCert,
}

/// Drives state transitions for one bootstrap run.
pub struct StateMachine<C> {
    config: Config,
    provider: CertProvider,
    ca_client: C,
}

impl<C: CaClient> StateMachine<C> {
    /// Assemble a machine from its collaborators.
    pub fn new(config: Config, provider: CertProvider, ca_client: C) -> Self {
        Self {
            config,
            provider,
            ca_client,
        }
    }

    /// Run until an [`SslContext`] with CA certificates and CRLs exists,
    /// and return it. Does not touch key or certificate machinery.
    pub fn ensure_ca_certificates(&self) -> Result<SslContext> {
        self.run(RunMode::TrustOnly)
    }

    /// Run to completion, returning a context holding the validated
    /// private key, client certificate and trust material.
    pub fn ensure_client_certificate(&self) -> Result<SslContext> {
        self.run(RunMode::ClientCert)
    }

    fn run(&self, mode: RunMode) -> Result<SslContext> {
        let lock = LockFile::new(self.config.lock_path());
        if !lock.lock()? {
            let pid = lock.holder()?.unwrap_or(0);
            return Err(Error::AnotherInstanceRunning {
                pid,
                path: lock.path().clone(),
            });
        }

        let deadline = self
            .config
            .maxwaitforcert
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));

        let result = self.run_states(mode, deadline);

        // The lock must be gone on every exit path, including the
        // process exit below.
        lock.unlock();

        match result {
            Err(Error::WaitForCertTimeout(timeout)) => {
                // The single place the machine terminates the process.
                println!("{timeout}");
                std::process::exit(1);
            }
            other => other,
        }
    }

    fn run_states(
        &self,
        mode: RunMode,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<SslContext> {
        let mut state = State::NeedCaCerts;
        loop {
            state = self.transition(state, deadline)?;
            match &state {
                State::NeedKey(ctx) if mode == RunMode::TrustOnly => return Ok(ctx.clone()),
                State::Done(ctx) => return Ok(ctx.clone()),
                _ => {}
            }
        }
    }

    fn transition(&self, state: State, deadline: Option<DateTime<Utc>>) -> Result<State> {
        debug!(state = state.name(), "entering state");
        match state {
            State::NeedCaCerts => self.need_cacerts(),
            State::NeedCrls(ctx) => self.need_crls(ctx),
            State::NeedKey(ctx) => self.need_key(ctx),
            State::NeedSubmitCsr { ssl_context, key } => self.need_submit_csr(ssl_context, key),
            State::NeedCert { ssl_context, key } => self.need_cert(ssl_context, key),
            State::Wait(ctx) => self.wait(ctx, deadline),
            State::Done(ctx) => Ok(State::Done(ctx)),
        }
    }

    fn need_cacerts(&self) -> Result<State> {
        if let Some(cacerts) = self.provider.load_cacerts()? {
            debug!(count = cacerts.len(), "using existing CA bundle");
            let ctx = SslContextBuilder::new(cacerts, Vec::new()).build()?;
            return Ok(State::NeedCrls(ctx));
        }

        info!("downloading CA bundle");
        let response = self.ca_client.get_ca_certificates(&SslContext::insecure())?;
        if response.status == 404 {
            return Err(Error::CaCertMissing);
        }
        if !response.success() {
            return Err(Error::CaCertDownloadFailed {
                status: response.status,
                reason: response.text(),
            });
        }

        let cacerts = cert::parse_cert_bundle(&response.body).map_err(Error::MalformedCaCert)?;
        let ctx = SslContextBuilder::new(cacerts, Vec::new()).build()?;
        self.provider.save_cacerts(ctx.cacerts())?;
        info!(count = ctx.cacerts().len(), "CA bundle downloaded");
        Ok(State::NeedCrls(ctx))
    }

    fn need_crls(&self, ctx: SslContext) -> Result<State> {
        if self.config.certificate_revocation == RevocationMode::Off {
            debug!("certificate revocation disabled, skipping CRLs");
            return Ok(State::NeedKey(ctx));
        }

        let (crls, fetched) = match self.provider.load_crls()? {
            None => {
                info!("downloading certificate revocation list");
                let response = self.ca_client.get_crls(&ctx, None)?;
                if response.status == 404 {
                    return Err(Error::CrlMissing);
                }
                if !response.success() {
                    return Err(Error::CrlDownloadFailed {
                        status: response.status,
                        reason: response.text(),
                    });
                }
                let crls =
                    cert::parse_crl_bundle(&response.body).map_err(Error::MalformedCrl)?;
                (crls, true)
            }
            Some((local, last_update)) => {
                let age = Utc::now().signed_duration_since(last_update);
                if age < Duration::seconds(self.config.crl_refresh_interval as i64) {
                    debug!("local CRLs are fresh");
                    (local, false)
                } else {
                    match self.try_refresh_crls(&ctx, last_update)? {
                        Some(updated) => (updated, true),
                        None => (local, false),
                    }
                }
            }
        };

        // Validation precedes persistence: a bundle that fails issuer or
        // signature checks never reaches disk.
        let rebuilt = SslContextBuilder::new(ctx.cacerts().to_vec(), crls).build()?;
        if fetched {
            self.provider.save_crls(rebuilt.crls())?;
        }
        Ok(State::NeedKey(rebuilt))
    }

    /// Conditional refresh of a stale local CRL. `None` means keep the
    /// local copy: a CA that is unreachable or misbehaving must not take
    /// down nodes that already hold usable trust material.
    fn try_refresh_crls(
        &self,
        ctx: &SslContext,
        last_update: DateTime<Utc>,
    ) -> Result<Option<Vec<cert::Crl>>> {
        debug!(%last_update, "refreshing certificate revocation list");
        let response = match self.ca_client.get_crls(ctx, Some(last_update)) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to refresh CRL, using local copy");
                return Ok(None);
            }
        };
        match response.status {
            304 => {
                debug!("CRL not modified");
                Ok(None)
            }
            200 => {
                let crls =
                    cert::parse_crl_bundle(&response.body).map_err(Error::MalformedCrl)?;
                info!(count = crls.len(), "certificate revocation list updated");
                Ok(Some(crls))
            }
            status => {
                warn!(status, "unexpected status refreshing CRL, using local copy");
                Ok(None)
            }
        }
    }

    fn need_key(&self, ctx: SslContext) -> Result<State> {
        let key = match self.provider.load_private_key()? {
            Some(key) => {
                if let Some(client_cert) = self.provider.load_client_cert()? {
                    debug!("using existing private key and certificate");
                    let full =
                        SslContextBuilder::new(ctx.cacerts().to_vec(), ctx.crls().to_vec())
                            .with_client_credentials(key, client_cert)
                            .build()?;
                    return Ok(State::Done(full));
                }
                debug!("using existing private key");
                key
            }
            None => {
                info!(
                    certname = %self.config.certname,
                    key_type = ?self.config.key_type,
                    "generating new private key"
                );
                let key = PrivateKey::generate(self.config.key_type, &self.config.named_curve)?;
                self.provider.save_private_key(&key)?;
                key
            }
        };
        Ok(State::NeedSubmitCsr {
            ssl_context: ctx,
            key,
        })
    }

    fn need_submit_csr(&self, ctx: SslContext, key: PrivateKey) -> Result<State> {
        let alt_names = self.config.alt_names()?;
        let attrs = self.config.csr_attributes()?;
        let csr_pem = csr::build_csr(&key, &self.config.certname, &alt_names, &attrs)?;

        // Persisted before transmission so the submitted request stays
        // inspectable even if the process dies mid-flight.
        self.provider.save_request(&self.config.certname, &csr_pem)?;

        info!(certname = %self.config.certname, "submitting certificate request");
        let response =
            self.ca_client
                .submit_certificate_request(&ctx, &self.config.certname, &csr_pem)?;
        if response.success() {
            return Ok(State::NeedCert {
                ssl_context: ctx,
                key,
            });
        }

        let body = response.text();
        if response.status == 400 && CSR_ALREADY_PHRASES.iter().any(|p| body.contains(p)) {
            debug!("CA already has a certificate for this name, proceeding");
            return Ok(State::NeedCert {
                ssl_context: ctx,
                key,
            });
        }

        Err(Error::CsrSubmitFailed {
            status: response.status,
            reason: body,
        })
    }

    fn need_cert(&self, ctx: SslContext, key: PrivateKey) -> Result<State> {
        let certname = &self.config.certname;
        let response = self.ca_client.get_certificate(&ctx, certname)?;
        if response.status != 200 {
            debug!(status = response.status, "certificate not yet available");
            return Ok(State::Wait(ctx));
        }

        let client_cert = match Cert::from_pem(&response.body) {
            Ok(cert) => cert,
            Err(reason) => {
                warn!(%certname, reason = %reason, "Failed to parse certificate, will retry");
                return Ok(State::Wait(ctx));
            }
        };

        let built = SslContextBuilder::new(ctx.cacerts().to_vec(), ctx.crls().to_vec())
            .with_client_credentials(key, client_cert.clone())
            .build();
        match built {
            Ok(full) => {
                self.provider.save_client_cert(certname, &client_cert)?;
                info!(%certname, "certificate downloaded and verified");
                Ok(State::Done(full))
            }
            Err(Error::KeyCertMismatch { subject }) => {
                warn!("Certificate {subject} does not match its private key, will retry");
                Ok(State::Wait(ctx))
            }
            Err(Error::CertificateRevoked { subject }) => {
                warn!("Certificate {subject} is revoked, will retry");
                Ok(State::Wait(ctx))
            }
            Err(e) => {
                warn!(error = %e, "Downloaded certificate failed verification, will retry");
                Ok(State::Wait(ctx))
            }
        }
    }

    fn wait(&self, _ctx: SslContext, deadline: Option<DateTime<Utc>>) -> Result<State> {
        match wait_decision(self.config.waitforcert, Utc::now(), deadline) {
            WaitDecision::ExitNoWait => Err(Error::WaitForCertTimeout(WaitTimeout::ZeroWait {
                certname: self.config.certname.clone(),
            })),
            WaitDecision::ExitDeadlineExceeded => Err(Error::WaitForCertTimeout(
                WaitTimeout::DeadlineExceeded {
                    certname: self.config.certname.clone(),
                },
            )),
            WaitDecision::Sleep(secs) => {
                info!("Will try again in {secs} seconds");
                std::thread::sleep(std::time::Duration::from_secs(secs));
                Ok(State::NeedCaCerts)
            }
        }
    }
}

/// What to do when the certificate is not ready.
#[derive(Debug, PartialEq, Eq)]
enum WaitDecision {
    /// `waitforcert` is 0: never poll
    ExitNoWait,
    /// The `maxwaitforcert` ceiling has passed
    ExitDeadlineExceeded,
    /// Sleep this many seconds, then restart the cycle
    Sleep(u64),
}

fn wait_decision(
    waitforcert: u64,
    now: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
) -> WaitDecision {
    if waitforcert == 0 {
        return WaitDecision::ExitNoWait;
    }
    if let Some(deadline) = deadline {
        if now >= deadline {
            return WaitDecision::ExitDeadlineExceeded;
        }
    }
    WaitDecision::Sleep(waitforcert)
}
