//! Bridge configuration
//!
//! Loaded from an optional JSON file (camelCase keys, every key optional)
//! and then overridden from the command line.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::relay::RelaySettings;
use crate::session::ble::BleSettings;
use crate::session::bt::BtSettings;
use crate::telegram::{FramerSettings, DEFAULT_MAX_LENGTH};
use crate::transport::framed::FramedSerialSettings;
use crate::transport::gatt::GattTarget;
use crate::transport::line::LineSerialSettings;
use crate::transport::serial::WritePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Upper bound on the blocking I/O worker pool.
    pub blocking_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 20110,
            tls_cert: None,
            tls_key: None,
            blocking_threads: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelegramConfig {
    pub max_length: usize,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            timeout_ms: 5000,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerialConfig {
    /// NXT device; auto-detected from `nxt_patterns` when unset.
    pub nxt_port: Option<String>,
    /// SPIKE device; auto-detected from `spike_patterns` when unset.
    pub spike_port: Option<String>,
    pub baud_rate: u32,
    pub nxt_patterns: Vec<String>,
    pub spike_patterns: Vec<String>,
    /// Node prefixes treated as classic Bluetooth devices.
    pub rfcomm_patterns: Vec<String>,
    /// Pause after interrupting the SPIKE REPL.
    pub spike_settle_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            nxt_port: None,
            spike_port: None,
            baud_rate: 115200,
            nxt_patterns: strings(&["cu.NXT", "tty.NXT", "ttyUSB"]),
            spike_patterns: strings(&["cu.LEGOHub", "tty.LEGOHub", "ttyACM"]),
            rfcomm_patterns: strings(&["rfcomm", "cu.", "tty."]),
            spike_settle_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayPolicyConfig {
    pub write_attempts: u32,
    pub write_retry_delay_ms: u64,
    pub reconnect_threshold: u32,
    pub reconnect_backoff_ms: u64,
    pub dead_poll_ms: u64,
    pub idle_backoff_ms: u64,
}

impl Default for RelayPolicyConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            write_retry_delay_ms: 20,
            reconnect_threshold: 5,
            reconnect_backoff_ms: 1000,
            dead_poll_ms: 100,
            idle_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub ble_scan_ms: u64,
    pub announce_interval_ms: u64,
    pub ble_keywords: Vec<String>,
    pub classic_keywords: Vec<String>,
    pub classic_rssi: i16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let ble = BleSettings::default();
        let bt = BtSettings::default();
        Self {
            ble_scan_ms: duration_ms(ble.scan_duration),
            announce_interval_ms: duration_ms(ble.announce_interval),
            ble_keywords: ble.keywords,
            classic_keywords: bt.keywords,
            classic_rssi: bt.rssi_hint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeepaliveConfig {
    pub interval_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_ms: 25_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BoostConfig {
    pub service: Uuid,
    pub characteristic: Uuid,
    /// Skip scanning and connect to this address.
    pub address: Option<String>,
    pub name_keywords: Vec<String>,
    pub read_wait_ms: u64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            service: Uuid::from_u128(0x0000_1623_1212_efde_1623_785f_eabc_d123),
            characteristic: Uuid::from_u128(0x0000_1624_1212_efde_1623_785f_eabc_d123),
            address: None,
            name_keywords: strings(&["Move Hub", "BOOST"]),
            read_wait_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub telegram: TelegramConfig,
    pub serial: SerialConfig,
    pub relay: RelayPolicyConfig,
    pub discovery: DiscoveryConfig,
    pub keepalive: KeepaliveConfig,
    pub boost: BoostConfig,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RelayConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.telegram.max_length;
        if max == 0 || max > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "telegram.maxLength must be 1..=65535, got {}",
                max
            )));
        }
        if self.relay.write_attempts == 0 {
            return Err(ConfigError::Invalid("relay.writeAttempts must be at least 1".into()));
        }
        if self.server.blocking_threads == 0 {
            return Err(ConfigError::Invalid("server.blockingThreads must be at least 1".into()));
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "server.tlsCert and server.tlsKey must be given together".into(),
            ));
        }
        Ok(())
    }

    pub fn framer_settings(&self) -> FramerSettings {
        FramerSettings {
            max_length: self.telegram.max_length,
            timeout: ms(self.telegram.timeout_ms),
            poll_interval: ms(self.telegram.poll_interval_ms),
        }
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            attempts: self.relay.write_attempts,
            delay: ms(self.relay.write_retry_delay_ms),
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            reconnect_threshold: self.relay.reconnect_threshold,
            reconnect_backoff: ms(self.relay.reconnect_backoff_ms),
            dead_poll: ms(self.relay.dead_poll_ms),
            idle_backoff: ms(self.relay.idle_backoff_ms),
        }
    }

    pub fn ble_settings(&self) -> BleSettings {
        BleSettings {
            scan_duration: ms(self.discovery.ble_scan_ms),
            announce_interval: ms(self.discovery.announce_interval_ms),
            keywords: self.discovery.ble_keywords.clone(),
        }
    }

    pub fn bt_settings(&self) -> BtSettings {
        BtSettings {
            patterns: self.serial.rfcomm_patterns.clone(),
            keywords: self.discovery.classic_keywords.clone(),
            rssi_hint: self.discovery.classic_rssi,
            announce_interval: ms(self.discovery.announce_interval_ms),
            baud_rate: self.serial.baud_rate,
            framer: self.framer_settings(),
            write: self.write_policy(),
            relay: self.relay_settings(),
            keepalive: ms(self.keepalive.interval_ms),
        }
    }

    pub fn framed_settings(&self, path: String) -> FramedSerialSettings {
        FramedSerialSettings {
            path,
            baud_rate: self.serial.baud_rate,
            framer: self.framer_settings(),
            write: self.write_policy(),
        }
    }

    pub fn line_settings(&self, path: String) -> LineSerialSettings {
        LineSerialSettings {
            path,
            baud_rate: self.serial.baud_rate,
            settle: ms(self.serial.spike_settle_ms),
        }
    }

    pub fn boost_target(&self) -> GattTarget {
        GattTarget {
            address: self.boost.address.clone(),
            name_keywords: self.boost.name_keywords.clone(),
            service: self.boost.service,
            characteristic: self.boost.characteristic,
            scan_duration: ms(self.discovery.ble_scan_ms),
            read_wait: ms(self.boost.read_wait_ms),
        }
    }
}
