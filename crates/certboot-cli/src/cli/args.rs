//! Command-line argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Bootstrap SSL credentials from a certificate authority
///
/// Fetches and validates CA certificates and CRLs, generates a private
/// key, submits a certificate signing request, and polls until the CA
/// signs the node's client certificate.
#[derive(Parser, Debug)]
#[command(name = "certboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// CA server hostname (or set CERTBOOT_SERVER env var)
    #[arg(short, long, env = "CERTBOOT_SERVER", global = true)]
    pub server: Option<String>,

    /// The node's identity: CSR subject CN and CA URL path element
    #[arg(long, global = true)]
    pub certname: Option<String>,

    /// Increase verbosity
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision key, certificate and trust material (runs to completion)
    Bootstrap(BootstrapArgs),

    /// Provision trust material only (CA certificates and CRLs)
    Trust,

    /// Summarize the credentials currently on disk
    Show,
}

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Seconds between poll attempts while the certificate is unsigned;
    /// 0 exits immediately instead of polling
    #[arg(long)]
    pub waitforcert: Option<u64>,

    /// Give up after this many seconds of waiting
    #[arg(long)]
    pub maxwaitforcert: Option<u64>,
}
