//! CLI argument parsing and command dispatch.

pub mod args;
pub mod commands;

use anyhow::{Context, Result};
use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use certboot::Config;

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Bootstrap(args) => commands::bootstrap(config, &args),
        Commands::Trust => commands::trust(config),
        Commands::Show => commands::show(config),
    }
}

/// Load configuration, layering CLI flags over the file.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let certname = cli.certname.clone().context(
                "no certname configured; pass --certname or a config file with one",
            )?;
            Config::new(certname)
        }
    };

    if let Some(certname) = &cli.certname {
        config.certname = certname.clone();
    }
    if let Some(server) = &cli.server {
        config.server = server.clone();
    }

    Ok(config)
}
