//! TOML configuration for the viewer library. Defaults match the
//! protocol constants; a missing file is written out on first run.

use crate::appearance::AppearanceConfig;
use circuline::CircuitConfig;
use circuline::consts;
use error::ConfigError;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod error;

const CONFIG_FILE_NAME: &str = "opaline.toml";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub appearance: AppearanceSection,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub mtu: usize,
    pub network_tick_ms: u64,
    pub resend_timeout_ms: u64,
    pub max_resends: u8,
    pub ping_interval_ms: u64,
    pub max_pending_acks: usize,
    pub packet_archive_size: usize,
    pub login_timeout_ms: u64,
    pub send_pings: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppearanceSection {
    pub max_concurrent_downloads: usize,
    pub wearable_timeout_ms: u64,
    pub texture_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub upload_retries: u32,
    pub rebake_delay_ms: u64,
    pub server_bake_retries: u32,
    pub send_appearance_updates: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mtu: consts::MTU,
            network_tick_ms: consts::NETWORK_TICK.as_millis() as u64,
            resend_timeout_ms: consts::RESEND_TIMEOUT.as_millis() as u64,
            max_resends: consts::MAX_RESENDS,
            ping_interval_ms: consts::PING_INTERVAL.as_millis() as u64,
            max_pending_acks: consts::MAX_PENDING_ACKS,
            packet_archive_size: consts::PACKET_ARCHIVE_SIZE,
            login_timeout_ms: consts::LOGIN_TIMEOUT.as_millis() as u64,
            send_pings: true,
        }
    }
}

impl Default for AppearanceSection {
    fn default() -> Self {
        let defaults = AppearanceConfig::default();
        Self {
            max_concurrent_downloads: defaults.max_concurrent_downloads,
            wearable_timeout_ms: defaults.wearable_timeout.as_millis() as u64,
            texture_timeout_ms: defaults.texture_timeout.as_millis() as u64,
            upload_timeout_ms: defaults.upload_timeout.as_millis() as u64,
            upload_retries: defaults.upload_retries,
            rebake_delay_ms: defaults.rebake_delay.as_millis() as u64,
            server_bake_retries: defaults.total_retries,
            send_appearance_updates: defaults.send_appearance_updates,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            appearance: AppearanceSection::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.mtu < 576 || self.network.mtu > 9000 {
            return Err(ConfigError::Validation(format!(
                "MTU {} is outside the sane range 576..=9000",
                self.network.mtu
            )));
        }
        if self.network.network_tick_ms == 0 {
            return Err(ConfigError::Validation(
                "network tick must be non-zero".to_string(),
            ));
        }
        if self.network.resend_timeout_ms < self.network.network_tick_ms {
            return Err(ConfigError::Validation(
                "resend timeout must be at least one network tick".to_string(),
            ));
        }
        if self.network.max_pending_acks == 0 || self.network.packet_archive_size == 0 {
            return Err(ConfigError::Validation(
                "ACK and archive capacities must be non-zero".to_string(),
            ));
        }
        if self.appearance.max_concurrent_downloads == 0 {
            return Err(ConfigError::Validation(
                "at least one concurrent download is required".to_string(),
            ));
        }
        Ok(())
    }

    /// The circuit tunables this configuration describes.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            mtu: self.network.mtu,
            network_tick: Duration::from_millis(self.network.network_tick_ms),
            resend_timeout: Duration::from_millis(self.network.resend_timeout_ms),
            max_resends: self.network.max_resends,
            ping_interval: Duration::from_millis(self.network.ping_interval_ms),
            max_pending_acks: self.network.max_pending_acks,
            archive_capacity: self.network.packet_archive_size,
            login_timeout: Duration::from_millis(self.network.login_timeout_ms),
            send_pings: self.network.send_pings,
            ..CircuitConfig::default()
        }
    }

    /// The appearance tunables this configuration describes.
    pub fn appearance_config(&self) -> AppearanceConfig {
        AppearanceConfig {
            max_concurrent_downloads: self.appearance.max_concurrent_downloads,
            wearable_timeout: Duration::from_millis(self.appearance.wearable_timeout_ms),
            texture_timeout: Duration::from_millis(self.appearance.texture_timeout_ms),
            upload_timeout: Duration::from_millis(self.appearance.upload_timeout_ms),
            upload_retries: self.appearance.upload_retries,
            rebake_delay: Duration::from_millis(self.appearance.rebake_delay_ms),
            total_retries: self.appearance.server_bake_retries,
            send_appearance_updates: self.appearance.send_appearance_updates,
            ..AppearanceConfig::default()
        }
    }
}

/// Loads `opaline.toml` from the working directory, writing the default
/// configuration first when none exists.
pub fn handle() -> Result<Config, ConfigError> {
    load_or_create(&PathBuf::from(CONFIG_FILE_NAME))
}

/// Loads a configuration file, seeding it with defaults when missing.
/// Validation runs on every load so a hand-edited file fails fast
/// instead of producing a circuit with nonsense tunables.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        let defaults = Config::default();
        write_config(&defaults, path)?;
        info!("Wrote default configuration to '{}'", path.display());
        return Ok(defaults);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

fn write_config(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config)?;
    fs::write(path, rendered).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })
}
