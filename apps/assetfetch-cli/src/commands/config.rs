use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};

use super::effective_config;

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Print the JSON schema of the config file
    Schema,
    /// Print the effective configuration
    Show(ShowArgs),
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
pub enum Format {
    #[default]
    Toml,
    Json,
}

#[derive(Args)]
pub struct ShowArgs {
    /// TOML config file; defaults plus ASSETFETCH_* overrides when omitted
    #[arg(long)]
    pub path: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Format::Toml)]
    pub format: Format,
}

pub fn cmd_config(cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema => {
            let schema = assetfetch_core::config_schema_json();
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        ConfigCmd::Show(args) => {
            let cfg = effective_config(args.path.as_deref())?;
            match args.format {
                Format::Toml => print!("{}", toml::to_string_pretty(&cfg)?),
                Format::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            }
        }
    }
    Ok(())
}
