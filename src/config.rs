//! Actor configuration delivered as TOML text through the CONFIG command.
//!
//! ```toml
//! [malamute]
//! endpoint = "tcp://127.0.0.1:1883"
//! address = "it.zmon.device"
//! producer = "zmon.device"
//!
//! [malamute.consumer]
//! "zmon.device" = ".*"
//!
//! [server]
//! file = "/var/lib/zm-device/devices.toml"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(toml::de::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub malamute: MalamuteConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Broker side of the configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MalamuteConfig {
    pub endpoint: Option<String>,
    /// Own mailbox address on the broker
    pub address: Option<String>,
    /// Stream change notifications are published on
    pub producer: Option<String>,
    /// stream name -> subject pattern
    #[serde(default)]
    pub consumer: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ServerConfig {
    pub file: Option<PathBuf>,
}

impl FromStr for DeviceConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }
}

impl DeviceConfig {
    /// Fresh list of (stream, pattern) subscriptions.
    pub fn consumers(&self) -> Vec<(String, String)> {
        self.malamute
            .consumer
            .iter()
            .map(|(stream, pattern)| (stream.clone(), pattern.clone()))
            .collect()
    }

    /// Resolves a slash separated path like `malamute/endpoint`.
    pub fn resolve(&self, path: &str) -> Option<String> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["malamute", "endpoint"] => self.malamute.endpoint.clone(),
            ["malamute", "address"] => self.malamute.address.clone(),
            ["malamute", "producer"] => self.malamute.producer.clone(),
            ["malamute", "consumer", stream] => self.malamute.consumer.get(*stream).cloned(),
            ["server", "file"] => self
                .server
                .file
                .as_ref()
                .map(|file| file.display().to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[malamute]
endpoint = "inproc://zm-device-test"
address = "it.zmon.device"
producer = "zmon.device"

[malamute.consumer]
"zmon.device" = ".*"
"zmon.alerts" = "CRIT.*"

[server]
file = "/tmp/devices.toml"
"#;

    #[test]
    fn parses_full_tree() {
        let config: DeviceConfig = FULL.parse().unwrap();

        assert_eq!(
            config.resolve("malamute/endpoint").as_deref(),
            Some("inproc://zm-device-test")
        );
        assert_eq!(config.resolve("malamute/address").as_deref(), Some("it.zmon.device"));
        assert_eq!(config.resolve("malamute/producer").as_deref(), Some("zmon.device"));
        assert_eq!(
            config.resolve("malamute/consumer/zmon.alerts").as_deref(),
            Some("CRIT.*")
        );
        assert_eq!(config.resolve("server/file").as_deref(), Some("/tmp/devices.toml"));
        assert_eq!(config.resolve("server/port"), None);
    }

    #[test]
    fn consumers_are_rebuilt_from_tree() {
        let config: DeviceConfig = FULL.parse().unwrap();

        assert_eq!(
            config.consumers(),
            vec![
                ("zmon.alerts".to_string(), "CRIT.*".to_string()),
                ("zmon.device".to_string(), ".*".to_string()),
            ]
        );
    }

    #[test]
    fn empty_text_is_an_empty_tree() {
        let config: DeviceConfig = "".parse().unwrap();

        assert_eq!(config, DeviceConfig::default());
        assert!(config.consumers().is_empty());
    }

    #[test]
    fn malformed_text_is_rejected() {
        let result = "malamute\n    endpoint = inproc://x\n".parse::<DeviceConfig>();

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
