//! Settings files describing which devices to talk to and how
//!
//! A settings document lists named device entries. Each entry picks one of
//! the built-in device kinds and may override its default profile. Files are
//! JSON or TOML, chosen by extension.

use crate::data::profile::DeviceProfile;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Built-in device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// G-code motion controller (command/response, line framed)
    Gcode,
    /// Load cell streaming fixed-length records without being asked
    ContinuousLoadCell,
    /// Load cell answering a query byte with one fixed-length record
    QueryLoadCell,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Gcode => write!(f, "gcode"),
            DeviceKind::ContinuousLoadCell => write!(f, "continuous-load-cell"),
            DeviceKind::QueryLoadCell => write!(f, "query-load-cell"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gcode" => Ok(DeviceKind::Gcode),
            "continuous-load-cell" => Ok(DeviceKind::ContinuousLoadCell),
            "query-load-cell" => Ok(DeviceKind::QueryLoadCell),
            other => Err(Error::config(format!("unknown device kind '{}'", other))),
        }
    }
}

/// One configured device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Name used to select this entry
    pub name: String,
    /// Which protocol the device speaks
    pub kind: DeviceKind,
    /// Device identifier to open; probed from the port list when absent
    #[serde(default)]
    pub port: Option<String>,
    /// Replaces the kind's default profile when present
    #[serde(default)]
    pub profile: Option<DeviceProfile>,
    /// Substring expected in a G-code controller's banner
    #[serde(default)]
    pub identification: Option<String>,
    /// Extra line prefixes a G-code controller emits that can be ignored
    #[serde(default)]
    pub ignore_prefixes: Vec<String>,
}

/// Top-level settings document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PeriphlinkConfig {
    /// Identifiers probed, in order, for entries without a port
    #[serde(default)]
    pub default_ports: Vec<String>,
    /// Configured devices
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl PeriphlinkConfig {
    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("Invalid JSON config: {}", e)))?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("Invalid TOML config: {}", e)))?
        } else {
            return Err(Error::config("Config file must be .json or .toml"));
        };

        config.validate()?;
        tracing::debug!(
            "Loaded {} device entries from {}",
            config.devices.len(),
            path.display()
        );
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self)
                .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?
        } else {
            return Err(Error::config("Config file must be .json or .toml"));
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.devices.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(Error::config(format!("device #{} has an empty name", i)));
            }
            if self.devices[..i].iter().any(|d| d.name == entry.name) {
                return Err(Error::config(format!("duplicate device name '{}'", entry.name)));
            }
            if let Some(profile) = &entry.profile {
                profile
                    .validate()
                    .map_err(|e| Error::config(format!("device '{}': {}", entry.name, e)))?;
            }
        }
        Ok(())
    }

    /// Look up a device entry by name
    pub fn device(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Identifiers to try for an entry: its own port, else the defaults
    pub fn candidate_ports(&self, entry: &DeviceEntry) -> Vec<String> {
        match &entry.port {
            Some(port) => vec![port.clone()],
            None => self.default_ports.clone(),
        }
    }
}
