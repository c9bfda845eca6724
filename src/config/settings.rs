//! Deployment-tunable protocol settings.
//!
//! ```toml
//! [protocol]
//! assignment_ttl_minutes = 30
//! max_pages_per_user = 3
//! sweep_interval_secs = 60
//! resync_interval_secs = 15
//! ```

use crate::error::{Error, Result};
use crate::model::TOTAL_PAGES;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    protocol: ProtocolSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolSettings {
    /// Lease lifetime before a claimed page may be reclaimed.
    pub assignment_ttl_minutes: u32,
    /// Per-participant cap on assigned plus completed pages.
    pub max_pages_per_user: u32,
    /// Interval of the background expiry sweep.
    pub sweep_interval_secs: u64,
    /// Interval of the dashboard's full resync.
    pub resync_interval_secs: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            assignment_ttl_minutes: 30,
            max_pages_per_user: 1,
            sweep_interval_secs: 60,
            resync_interval_secs: 15,
        }
    }
}

impl ProtocolSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad settings file: {e}")))?;
        file.protocol.validate()?;
        Ok(file.protocol)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Override individual fields from `HATYM_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = parsed_var("HATYM_ASSIGNMENT_TTL_MINUTES")? {
            self.assignment_ttl_minutes = v;
        }
        if let Some(v) = parsed_var("HATYM_MAX_PAGES_PER_USER")? {
            self.max_pages_per_user = v;
        }
        if let Some(v) = parsed_var("HATYM_SWEEP_INTERVAL_SECS")? {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = parsed_var("HATYM_RESYNC_INTERVAL_SECS")? {
            self.resync_interval_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.assignment_ttl_minutes == 0 {
            return Err(Error::Config(
                "assignment_ttl_minutes must be at least 1".to_string(),
            ));
        }
        if self.max_pages_per_user == 0 || self.max_pages_per_user > u32::from(TOTAL_PAGES) {
            return Err(Error::Config(format!(
                "max_pages_per_user must be in 1..={TOTAL_PAGES}, got {}",
                self.max_pages_per_user
            )));
        }
        if self.sweep_interval_secs == 0 || self.resync_interval_secs == 0 {
            return Err(Error::Config("intervals must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn assignment_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.assignment_ttl_minutes))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
