use std::path::Path;

use anyhow::{Context, Result};
use depfleet_core::config::DepfleetConfig;

const DEFAULT_CONFIG_FILE: &str = "depfleet.toml";

/// Reads the configuration file, falling back to `./depfleet.toml` and then
/// to built-in defaults. An explicit path must exist.
pub fn load(path: Option<&Path>) -> Result<DepfleetConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Path::new(DEFAULT_CONFIG_FILE),
        None => return Ok(DepfleetConfig::default()),
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    parse(&content).with_context(|| format!("invalid config file '{}'", path.display()))
}

fn parse(content: &str) -> Result<DepfleetConfig> {
    Ok(toml::from_str(content)?)
}
