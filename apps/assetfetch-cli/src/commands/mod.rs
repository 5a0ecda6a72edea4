pub mod config;
pub mod fetch;
pub mod key;

pub use config::ConfigCmd;
pub use fetch::FetchArgs;
pub use key::KeyArgs;

use std::path::Path;

use anyhow::{Context, Result};
use assetfetch_core::{load_config, FetchConfig};

/// The config file when given (env overrides included), else defaults plus
/// env overrides.
pub fn effective_config(path: Option<&Path>) -> Result<FetchConfig> {
    match path {
        Some(path) => {
            load_config(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => Ok(FetchConfig::from_env()),
    }
}
