//! # certboot-cli
//!
//! Command-line interface for the certboot bootstrap state machine.
//!
//! ## Commands
//!
//! - `certboot bootstrap`: run the full machine to a signed client
//!   certificate, provisioning trust material, key and CSR on the way.
//! - `certboot trust`: stop once CA certificates and CRLs are in place.
//! - `certboot show`: summarize the credentials currently on disk.

pub mod cli;

pub use cli::run;
