#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)] // TODO(deps-001): remove once transitive dependencies converge.

//! Main entry point for the relaychat server CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::{Config, ServiceRole};

/// Main CLI structure for the relaychat server
#[derive(Debug, Parser)]
#[command(name = "relaychat")]
#[command(about = "Writer and reader processes for relaychat", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a server process
    Serve {
        /// Port to bind, overriding the configuration file
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a YAML, TOML or JSON configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Which side this process serves: writer, reader or combined
        #[arg(long, short)]
        role: Option<ServiceRole>,
    },
}

/// Loads configuration for `serve` and runs the server until shutdown.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(
    port: Option<u16>,
    config: Option<PathBuf>,
    role: Option<ServiceRole>,
) -> anyhow::Result<()> {
    let resolved = Config::load_with_overrides(config, port, role)?;
    server::server::run(resolved).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config, role } => handle_serve_command(port, config, role).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_role() {
        let cli = Cli::try_parse_from([
            "relaychat", "serve", "--port", "9000", "--role", "reader",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { port, config, role } => {
                assert_eq!(port, Some(9000));
                assert!(config.is_none());
                assert_eq!(role, Some(ServiceRole::Reader));
            }
        }
    }

    #[test]
    fn rejects_unknown_role() {
        let result = Cli::try_parse_from(["relaychat", "serve", "--role", "janitor"]);
        assert!(result.is_err());
    }

    #[test]
    fn port_and_config_are_optional() {
        let cli = Cli::try_parse_from(["relaychat", "serve"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Serve {
                port: None,
                config: None,
                role: None
            }
        ));
    }
}
