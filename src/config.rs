//! Application settings persisted between runs.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::icmp::IpVersion;

fn default_interval() -> f64 {
    1.0
}

fn default_ip_version() -> IpVersion {
    IpVersion::V4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub default_host: Option<String>,
    /// Factory id tried before the registry's own pick.
    #[serde(default)]
    pub default_ping_engine: Option<String>,
    /// Seconds between echo requests.
    #[serde(default = "default_interval")]
    pub default_ping_interval: f64,
    #[serde(default = "default_ip_version")]
    pub default_ip_version: IpVersion,
    /// Saved engine configuration documents, keyed by factory id.
    #[serde(default)]
    pub engines: BTreeMap<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_host: None,
            default_ping_engine: None,
            default_ping_interval: default_interval(),
            default_ip_version: default_ip_version(),
            engines: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// `<config dir>/routeping/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("routeping").join("settings.json"))
    }

    /// A missing file yields the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Malformed settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write settings to {}", path.display()))?;
        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Interval in whole milliseconds, never below 1.
    pub fn interval_ms(&self) -> u64 {
        if self.default_ping_interval.is_finite() && self.default_ping_interval > 0.0 {
            ((self.default_ping_interval * 1000.0).round() as u64).max(1)
        } else {
            1000
        }
    }

    pub fn engine_document(&self, factory_id: &str) -> Option<&Value> {
        self.engines.get(factory_id)
    }

    pub fn store_engine_document(&mut self, factory_id: &str, document: Value) {
        self.engines.insert(factory_id.to_string(), document);
    }
}
