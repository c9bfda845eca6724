//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.
//! Protocol tunables come from an optional TOML file (`HATYM_CONFIG`) and
//! can be overridden one by one from the environment.

pub mod settings;

pub use settings::ProtocolSettings;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Where this device keeps its participant id and lease tokens.
    pub state_dir: PathBuf,
    pub protocol: ProtocolSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut protocol = match std::env::var("HATYM_CONFIG") {
            Ok(path) => ProtocolSettings::load_from_file(Path::new(&path))?,
            Err(_) => ProtocolSettings::default(),
        };
        protocol.apply_env_overrides()?;
        protocol.validate()?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            state_dir: std::env::var("HATYM_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_state_dir()),
            protocol,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn default_state_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".hatym"),
        Err(_) => PathBuf::from(".hatym"),
    }
}
