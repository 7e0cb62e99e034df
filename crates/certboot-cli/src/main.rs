//! certboot - SSL bootstrap CLI
//!
//! Provision a node's private key, client certificate and trust material
//! from a certificate authority.

use anyhow::Result;

fn main() -> Result<()> {
    certboot_cli::run()
}
