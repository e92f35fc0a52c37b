//! Device configuration loaded from a TOML file.
//!
//! The path comes from `$LUMENLINK_CONFIG` or defaults to
//! `<config dir>/lumenlink/config.toml`. A missing file is created with defaults so the
//! operator only has to fill in the device identity and broker credentials.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "LUMENLINK_CONFIG";
const APP_DIR: &str = "lumenlink";
const CONFIG_FILE: &str = "config.toml";
const STORE_FILE: &str = "store.toml";
const IMAGE_DIR: &str = "images";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identity used in topics and the MQTT client id
    pub uid: String,
    /// Reported firmware version; the crate version when unset
    pub version: Option<String>,
    pub serial: SerialConfig,
    pub power: PowerConfig,
    pub mqtt: MqttConfig,
    pub network: NetworkConfig,
    pub ntp: NtpConfig,
    pub update: UpdateConfig,
    pub store: StoreConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB2".to_string(),
            baud_rate: 115200,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PowerConfig {
    /// BCM pin of the modem power key; unset when the key is not wired
    pub gpio_pin: Option<u8>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_prefix: String,
    pub device_topic_prefix: String,
    pub group_topic_prefix: String,
    pub downlink_suffix: String,
    pub group_suffix: String,
    pub uplink_suffix: String,
    pub default_keepalive: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "broker.example.net".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_prefix: "lumen_sw_".to_string(),
            device_topic_prefix: "lumen/star/devices/eui-".to_string(),
            group_topic_prefix: "lumen/group/devices/eui-".to_string(),
            downlink_suffix: "/down/push".to_string(),
            group_suffix: "/down/lux".to_string(),
            uplink_suffix: "/up".to_string(),
            default_keepalive: 360,
        }
    }
}

impl MqttConfig {
    pub fn client_id(&self, uid: &str) -> String {
        format!("{}{}", self.client_prefix, uid)
    }

    pub fn device_topic(&self, uid: &str) -> String {
        format!("{}{}{}", self.device_topic_prefix, uid, self.downlink_suffix)
    }

    pub fn uplink_topic(&self, uid: &str) -> String {
        format!("{}{}{}", self.device_topic_prefix, uid, self.uplink_suffix)
    }

    /// Topic a master publishes lux readings on and its slaves subscribe to
    pub fn group_topic(&self, master_uid: &str) -> String {
        format!("{}{}{}", self.group_topic_prefix, master_uid, self.group_suffix)
    }
}

/// SIM carrier recognized by its CCID prefix
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Carrier {
    pub name: String,
    pub ccid_prefix: String,
    pub apn: String,
    /// Locked carriers never scan for operators and skip the EPS registration URC
    #[serde(default)]
    pub locked: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct NetworkConfig {
    pub default_apn: String,
    pub carriers: Vec<Carrier>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_apn: "iot.1nce.net".to_string(),
            carriers: vec![Carrier {
                name: "telia".to_string(),
                ccid_prefix: "8945".to_string(),
                apn: "lpwa.telia.iot".to_string(),
                locked: true,
            }],
        }
    }
}

impl NetworkConfig {
    pub fn carrier_for(&self, ccid: &str) -> Carrier {
        self.carriers
            .iter()
            .find(|c| !c.ccid_prefix.is_empty() && ccid.starts_with(&c.ccid_prefix))
            .cloned()
            .unwrap_or_else(|| Carrier {
                name: "default".to_string(),
                ccid_prefix: String::new(),
                apn: self.default_apn.clone(),
                locked: false,
            })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct NtpConfig {
    pub server: String,
    pub auto_sync: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            server: "ntp.se".to_string(),
            auto_sync: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct UpdateConfig {
    pub base_url: String,
    pub staging_file: String,
    pub image_dir: PathBuf,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            base_url: "http://updates.example.net:5000/update".to_string(),
            staging_file: "firmware.bin".to_string(),
            image_dir: data_dir().join(IMAGE_DIR),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join(STORE_FILE),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_ms: u64,
    pub channel_capacity: usize,
    pub watchdog_timeout_s: u64,
    /// Interval of the STATUS_REPORT heartbeat posted by the binary; 0 disables it
    pub status_interval_s: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            channel_capacity: 32,
            watchdog_timeout_s: 120,
            status_interval_s: 900,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn default_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE),
    }
}

impl DeviceConfig {
    pub fn reported_version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Loads the configuration, writing a default file first when none exists
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            warn!("No config at {}, writing defaults", path.display());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
            }
            let content = toml::to_string_pretty(&DeviceConfig::default())
                .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
            tokio::fs::write(path, content)
                .await
                .map_err(|e| eyre!("Failed to write default config: {}", e))?;
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config {}: {}", path.display(), e))?;
        let config: DeviceConfig =
            toml::from_str(&content).map_err(|e| eyre!("Invalid config: {}", e))?;
        config.validate()?;
        info!("Loaded config for device {}", config.uid);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.uid.trim().is_empty() {
            return Err(eyre!("Device uid is not set"));
        }
        if self.runtime.tick_ms == 0 {
            return Err(eyre!("runtime.tick_ms must be positive"));
        }
        if self.runtime.channel_capacity == 0 {
            return Err(eyre!("runtime.channel_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn carrier_lookup_by_ccid_prefix() {
        let network = NetworkConfig::default();
        let telia = network.carrier_for("89450421180216000000");
        assert!(telia.locked);
        assert_eq!(telia.apn, "lpwa.telia.iot");

        let other = network.carrier_for("89882280000012345678");
        assert!(!other.locked);
        assert_eq!(other.apn, "iot.1nce.net");
    }

    #[test]
    fn topics_are_built_from_uid() {
        let mqtt = MqttConfig::default();
        assert_eq!(mqtt.device_topic("AB12"), "lumen/star/devices/eui-AB12/down/push");
        assert_eq!(mqtt.uplink_topic("AB12"), "lumen/star/devices/eui-AB12/up");
        assert_eq!(mqtt.group_topic("FF00"), "lumen/group/devices/eui-FF00/down/lux");
        assert_eq!(mqtt.client_id("AB12"), "lumen_sw_AB12");
    }

    #[tokio::test]
    async fn default_file_is_written_but_needs_a_uid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg").join("config.toml");

        let err = DeviceConfig::load_or_init(&path).await.unwrap_err();
        assert!(err.to_string().contains("uid"));
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let patched = content.replacen("uid = \"\"", "uid = \"0011AABB\"", 1);
        std::fs::write(&path, patched).unwrap();

        let config = DeviceConfig::load_or_init(&path).await.unwrap();
        assert_eq!(config.uid, "0011AABB");
        assert_eq!(config.runtime.tick_ms, 200);
        assert_eq!(config.ntp.server, "ntp.se");
    }
}
