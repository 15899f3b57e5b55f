//! Loads [`relay_core::RelayConfig`] from an optional TOML file plus
//! `RELAY_`-prefixed environment overrides, the way
//! `cdk-mintd::config::Settings::new` layers file contents over defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use relay_core::RelayConfig;

const DEFAULT_CONFIG_FILE: &str = "relay.toml";

pub fn load_settings(config_path: Option<String>) -> Result<RelayConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let builder = Config::builder()
        .add_source(File::from(path.as_path()).required(false))
        .add_source(Environment::with_prefix("RELAY").separator("__"));

    let config = builder.build().context("failed to assemble configuration")?;
    config
        .try_deserialize()
        .context("failed to parse configuration (is `self-uri` set?)")
}
