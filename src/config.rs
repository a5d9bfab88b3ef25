use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::{CollectorSettings, DeviceConfig};
use crate::mqtt::MqttConfig;

const APP_DIR: &str = "ground-relay";
const CONFIG_FILE: &str = "config.toml";

/// Application configuration: defaults, then TOML file, then environment
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct RelayConfig {
    pub log_level: String,
    pub mqtt: MqttConfig,
    pub devices: DeviceConfig,
    pub collector: CollectorSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mqtt: MqttConfig::default(),
            devices: DeviceConfig::default(),
            collector: CollectorSettings::default(),
        }
    }
}

impl RelayConfig {
    /// Loads `path` if given, otherwise the per-user config file if it
    /// exists, and applies environment overrides on top.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => match default_path() {
                Some(path)
                    if tokio::fs::try_exists(&path)
                        .await
                        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))? =>
                {
                    Some(path)
                }
                _ => None,
            },
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path).await?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    /// Environment variables as the ground-control deployment sets them.
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER_URL") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(e) => warn!("Ignoring MQTT_BROKER_PORT={}: {}", port, e),
            }
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = username;
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = password;
        }
        if let Some(prefix) = lookup("MQTT_CLIENT_ID_PREFIX") {
            self.mqtt.client_id_prefix = prefix;
        }
        if let Some(interval) = lookup("MQTT_RECONNECT_INTERVAL") {
            match interval.parse() {
                Ok(secs) => self.mqtt.reconnect_ceiling_secs = secs,
                Err(e) => warn!("Ignoring MQTT_RECONNECT_INTERVAL={}: {}", interval, e),
            }
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
    }
}

/// `<config dir>/ground-relay/config.toml`, if the platform has a config dir
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [mqtt]
            host = "broker.local"
            publish_hz = 20

            [mqtt.topics]
            chassis_inbound = "rover/chassis/cmd"

            [devices]
            joystick_deadzone = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.publish_hz, 20);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topics.chassis_inbound, "rover/chassis/cmd");
        assert_eq!(config.mqtt.topics.chassis_outbound, "orion/topic/chassis/outbound");
        assert_eq!(config.devices.joystick_deadzone, 0.1);
        assert_eq!(config.collector.poll_interval_ms, 20);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(RelayConfig::from_toml_str("[mqtt\nhost=").is_err());
    }

    #[test]
    fn environment_wins_over_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MQTT_BROKER_URL", "10.0.0.5"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_USERNAME", "rover"),
            ("MQTT_PASSWORD", "hunter2"),
            ("MQTT_CLIENT_ID_PREFIX", "station-"),
            ("MQTT_RECONNECT_INTERVAL", "10"),
            ("LOG_LEVEL", "DEBUG"),
        ]);
        let mut config = RelayConfig::from_toml_str("[mqtt]\nhost = \"from-file\"").unwrap();
        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.mqtt.host, "10.0.0.5");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username, "rover");
        assert_eq!(config.mqtt.password, "hunter2");
        assert_eq!(config.mqtt.client_id_prefix, "station-");
        assert_eq!(config.mqtt.reconnect_ceiling_secs, 10);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn unparsable_env_values_are_ignored() {
        let mut config = RelayConfig::default();
        config.apply_env_overrides(|key| match key {
            "MQTT_BROKER_PORT" => Some("not-a-port".to_string()),
            "MQTT_RECONNECT_INTERVAL" => Some("-3".to_string()),
            _ => None,
        });
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.reconnect_ceiling_secs, 5);
    }

    #[tokio::test]
    async fn missing_explicit_file_is_an_error() {
        let result = RelayConfig::load(Some(Path::new("/nonexistent/ground-relay.toml"))).await;
        assert!(result.is_err());
    }
}
