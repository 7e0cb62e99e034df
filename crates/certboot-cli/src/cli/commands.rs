//! Command implementations.

use anyhow::Result;

use certboot::{CertProvider, Config, HttpCaClient, StateMachine};

use super::args::BootstrapArgs;

/// Run the full bootstrap to a signed client certificate.
pub fn bootstrap(mut config: Config, args: &BootstrapArgs) -> Result<()> {
    if let Some(waitforcert) = args.waitforcert {
        config.waitforcert = waitforcert;
    }
    if let Some(maxwaitforcert) = args.maxwaitforcert {
        config.maxwaitforcert = Some(maxwaitforcert);
    }

    let certname = config.certname.clone();
    let machine = build_machine(config);
    let ctx = machine.ensure_client_certificate()?;

    println!("Certificate provisioned for {certname}");
    if let Some(cert) = ctx.client_cert() {
        println!("  subject:     {}", cert.subject());
        println!("  fingerprint: {}", cert.fingerprint());
    }
    Ok(())
}

/// Provision CA certificates and CRLs only.
pub fn trust(config: Config) -> Result<()> {
    let machine = build_machine(config);
    let ctx = machine.ensure_ca_certificates()?;

    println!(
        "Trust material in place: {} CA certificate(s), {} CRL(s)",
        ctx.cacerts().len(),
        ctx.crls().len()
    );
    Ok(())
}

/// Summarize the credentials currently on disk.
pub fn show(config: Config) -> Result<()> {
    let provider = CertProvider::from_config(&config);

    println!("certname: {}", config.certname);
    println!("ssldir:   {}", config.ssldir.display());

    match provider.load_cacerts()? {
        Some(cacerts) => println!("CA bundle: {} certificate(s)", cacerts.len()),
        None => println!("CA bundle: absent"),
    }
    match provider.load_crls()? {
        Some((crls, last_update)) => {
            println!("CRL bundle: {} CRL(s), last updated {last_update}", crls.len());
        }
        None => println!("CRL bundle: absent"),
    }
    match provider.load_private_key()? {
        Some(key) => println!("private key: {}", key.type_label()),
        None => println!("private key: absent"),
    }
    match provider.load_client_cert()? {
        Some(cert) => {
            println!("certificate: {}", cert.subject());
            if let Some(not_after) = cert.not_after() {
                println!("  expires:     {not_after}");
            }
            println!("  fingerprint: {}", cert.fingerprint());
        }
        None => {
            println!("certificate: absent");
            if provider.load_request()?.is_some() {
                println!("  a certificate request is saved and may be awaiting signature");
            }
        }
    }
    Ok(())
}

fn build_machine(config: Config) -> StateMachine<HttpCaClient> {
    let provider = CertProvider::from_config(&config);
    let ca_client = HttpCaClient::new(&config);
    StateMachine::new(config, provider, ca_client)
}
