use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "edgeguard")]
#[command(about = "Edgeguard operator tooling: secrets, schema and configuration")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Default log level when RUST_LOG is not set
    #[arg(long, global = true, env = "EDGEGUARD_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a root key, lookup key and admin secret
    Keygen(KeygenArgs),
    /// Create the account and token tables
    Migrate(MigrateArgs),
    /// Load and validate a configuration file
    CheckConfig(CheckConfigArgs),
}

#[derive(Clone, Copy, ValueEnum, Default, Debug, PartialEq, Eq)]
pub enum KeyEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(clap::Args)]
pub struct KeygenArgs {
    /// Encoding of the generated keys
    #[arg(long, default_value = "hex")]
    pub encoding: KeyEncoding,
    /// Skip the admin secret
    #[arg(long)]
    pub no_admin: bool,
}

#[derive(clap::Args)]
pub struct MigrateArgs {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
}

#[derive(clap::Args)]
pub struct CheckConfigArgs {
    /// TOML file; environment overrides (EDGEGUARD__SECTION__KEY) apply on top
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_keygen_base64() {
        let cli = Cli::parse_from(["edgeguard", "keygen", "--encoding", "base64", "--no-admin"]);
        match cli.command {
            Commands::Keygen(args) => {
                assert_eq!(args.encoding, KeyEncoding::Base64);
                assert!(args.no_admin);
            }
            _ => panic!("expected keygen"),
        }
    }

    #[test]
    fn test_parse_check_config_path() {
        let cli = Cli::parse_from(["edgeguard", "check-config", "edgeguard.toml"]);
        match cli.command {
            Commands::CheckConfig(args) => {
                assert_eq!(args.path, Some(PathBuf::from("edgeguard.toml")));
            }
            _ => panic!("expected check-config"),
        }
    }
}
