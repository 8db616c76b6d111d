//! Settings type definitions.
//!
//! Sections use `#[serde(rename_all = "camelCase", default)]` so partial JSON
//! files work. The `mapping` entries keep the snake_case keys of the
//! historical config format.

use std::collections::BTreeMap;

use rollout_core::Service;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub log: LogSettings,
    pub release: ReleaseSettings,
    pub logging: LoggingSettings,
    /// How long shutdown waits for running deployments to finish.
    pub shutdown_timeout_secs: u64,
    /// Service handle -> deploy target.
    pub mapping: BTreeMap<String, ServiceSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            log: LogSettings::default(),
            release: ReleaseSettings::default(),
            logging: LoggingSettings::default(),
            shutdown_timeout_secs: 30,
            mapping: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Validate the mapping and turn it into service descriptors, sorted by
    /// handle.
    pub fn services(&self) -> Result<Vec<Service>> {
        self.mapping
            .iter()
            .map(|(handle, entry)| entry.to_service(handle))
            .collect()
    }
}

/// HTTP listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// How hard the event log pushes each append to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Committed on append, fsynced at checkpoints.
    #[default]
    Normal,
    /// Fsynced on every append.
    Full,
}

/// Event log storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogSettings {
    pub path: String,
    pub durability: Durability,
    pub reader_pool_size: u32,
    pub busy_timeout_ms: u32,
    /// Live-tail channel capacity before slow subscribers fall back to storage.
    pub subscriber_buffer: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            path: "./data/events.db".to_string(),
            durability: Durability::Normal,
            reader_pool_size: 4,
            busy_timeout_ms: 5000,
            subscriber_buffer: 1024,
        }
    }
}

/// External release command.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseSettings {
    pub program: String,
    pub args: Vec<String>,
    /// Kill the release command after this long. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            program: "li-release".to_string(),
            args: vec!["upgrade-rancher-container".to_string()],
            timeout_secs: None,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            modules: BTreeMap::new(),
        }
    }
}

/// One `mapping` entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub rancher_service_id: String,
    #[serde(default)]
    pub docker_image: String,
}

impl ServiceSettings {
    fn to_service(&self, handle: &str) -> Result<Service> {
        if handle.trim().is_empty() {
            return Err(SettingsError::InvalidValue("service handle is required".into()));
        }
        if self.rancher_service_id.trim().is_empty() {
            return Err(SettingsError::InvalidValue(format!(
                "service.rancher_service_id is required ({handle})"
            )));
        }
        if self.docker_image.trim().is_empty() {
            return Err(SettingsError::InvalidValue(format!(
                "service.docker_image is required ({handle})"
            )));
        }
        Ok(Service::new(handle, &self.docker_image, &self.rancher_service_id))
    }
}
