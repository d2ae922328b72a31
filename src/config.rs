//! Engine configuration.
//!
//! Loading these from files or the environment is left to the host; every
//! struct deserializes with defaults for missing fields.

use serde::Deserialize;
use std::time::Duration;

/// Document store connection settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory://<label>`, `file://<dir>` or a bare directory path.
    pub address: String,

    /// Tenant prefix applied to every key (the sandbox name).
    pub namespace: String,

    /// Keys fetched per scan round trip.
    /// Default: 50
    pub scan_page_size: usize,

    /// Appended log operations before the file backend rewrites its log.
    /// Default: 10000
    pub compact_after: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "memory://default".to_string(),
            namespace: "default".to_string(),
            scan_page_size: 50,
            compact_after: 10_000,
        }
    }
}

/// Registry key and link layout.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Middle segment of `<namespace>:<resourceType>:<id>`.
    pub resource_type: String,

    /// Prefix of every self link; `subscriptions/<id>` is appended.
    pub base_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resource_type: "subscriptions".to_string(),
            base_path: "http://localhost/".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Default: 1000
    pub interval_ms: u64,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Component name stamped on every audit entry.
    pub logger_name: String,

    /// None leaves the HTTP client's own default in place.
    pub request_timeout_ms: Option<u64>,

    /// Entries kept by the in-memory audit sink.
    pub audit_capacity: usize,

    /// Newest audit entries also kept in the store (0 = don't persist).
    pub persisted_audit_entries: usize,
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            logger_name: "subscription-engine".to_string(),
            request_timeout_ms: None,
            audit_capacity: 1000,
            persisted_audit_entries: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub sweeper: SweeperConfig,
    pub dispatcher: DispatcherConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"store": {"namespace": "sbox1"}, "sweeper": {"interval_ms": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.store.namespace, "sbox1");
        assert_eq!(config.store.scan_page_size, 50);
        assert_eq!(config.registry.resource_type, "subscriptions");
        assert_eq!(config.sweeper.interval(), Duration::from_millis(250));
        assert!(config.sweeper.enabled);
        assert!(config.dispatcher.request_timeout().is_none());
    }
}
