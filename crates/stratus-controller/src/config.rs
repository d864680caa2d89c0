use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level controller configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub controller: ControllerGlobal,
    #[serde(default)]
    pub cnci: CnciSettings,
}

/// Global controller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerGlobal {
    /// Message bus address (host:port).
    pub bus_address: String,
    /// Datastore snapshot path. Empty means in-memory only.
    #[serde(default)]
    pub datastore_path: String,
    /// Max time to wait for a sync delete to complete (seconds).
    #[serde(default = "default_sync_delete_timeout")]
    pub sync_delete_timeout_secs: u64,
    /// Max concurrent per-instance launch tasks in a batch. 0 means the
    /// host CPU count.
    #[serde(default)]
    pub launch_parallelism: usize,
}

/// CNCI lifecycle timing.
#[derive(Debug, Clone, Deserialize)]
pub struct CnciSettings {
    /// Max time to wait for a CNCI added/removed event (seconds).
    #[serde(default = "default_cnci_event_timeout")]
    pub event_timeout_secs: u64,
    /// Delay before an empty subnet's CNCI is torn down (seconds).
    #[serde(default = "default_teardown_delay")]
    pub teardown_delay_secs: u64,
}

fn default_sync_delete_timeout() -> u64 {
    120
}
fn default_cnci_event_timeout() -> u64 {
    120
}
fn default_teardown_delay() -> u64 {
    300
}

impl Default for CnciSettings {
    fn default() -> Self {
        Self {
            event_timeout_secs: default_cnci_event_timeout(),
            teardown_delay_secs: default_teardown_delay(),
        }
    }
}

impl ControllerConfig {
    /// Load controller config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read controller config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse controller config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).with_context(|| "Failed to parse controller config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.controller.bus_address.is_empty() {
            anyhow::bail!("controller.bus_address must be set");
        }
        if self.cnci.event_timeout_secs == 0 {
            anyhow::bail!("cnci.event_timeout_secs must be non-zero");
        }
        Ok(())
    }

    /// Effective launch parallelism: configured value or the host CPU count.
    pub fn launch_parallelism(&self) -> usize {
        if self.controller.launch_parallelism > 0 {
            self.controller.launch_parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = ControllerConfig::parse(
            r#"
[controller]
bus_address = "127.0.0.1:9000"
"#,
        )
        .unwrap();
        assert_eq!(config.controller.bus_address, "127.0.0.1:9000");
        assert_eq!(config.controller.sync_delete_timeout_secs, 120);
        assert_eq!(config.cnci.event_timeout_secs, 120);
        assert_eq!(config.cnci.teardown_delay_secs, 300);
        assert!(config.launch_parallelism() >= 1);
    }

    #[test]
    fn test_parse_overrides() {
        let config = ControllerConfig::parse(
            r#"
[controller]
bus_address = "bus.internal:9000"
datastore_path = "/var/lib/stratus/state.json"
launch_parallelism = 4

[cnci]
event_timeout_secs = 30
teardown_delay_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(config.controller.datastore_path, "/var/lib/stratus/state.json");
        assert_eq!(config.launch_parallelism(), 4);
        assert_eq!(config.cnci.event_timeout_secs, 30);
        assert_eq!(config.cnci.teardown_delay_secs, 60);
    }

    #[test]
    fn test_missing_bus_address_rejected() {
        assert!(ControllerConfig::parse("[controller]\nbus_address = \"\"").is_err());
    }

    #[test]
    fn test_zero_event_timeout_rejected() {
        let result = ControllerConfig::parse(
            r#"
[controller]
bus_address = "127.0.0.1:9000"

[cnci]
event_timeout_secs = 0
"#,
        );
        assert!(result.is_err());
    }
}
