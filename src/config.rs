// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application configuration management.
//!
//! This module handles persistent configuration storage using TOML format.
//! It supports multi-device configurations and automatic migration from
//! legacy single-device configs.

use log::info;
use sdr_engine::{CorrectionMode, Placement, StreamSettings};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const APP_NAME: &str = "sdrpump";
const CONFIG_NAME: &str = "config";

/// Kind of SDR device behind a configured entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Synthetic tone generator, no hardware required
    TestSignal,
    /// 16-bit stereo IQ WAV file playback
    WavFile,
    /// RTL-SDR USB dongle (requires the `hardware` feature)
    RtlSdr,
}

/// Configuration for a single SDR device
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceEntry {
    /// Unique identifier for this device (stable across renames)
    pub id: String,

    /// User-friendly display name
    pub name: String,

    /// Device kind
    pub kind: DeviceKind,

    /// Hardware serial number (empty matches the first device found)
    #[serde(default)]
    pub serial: String,

    /// Whether this device is selectable on startup
    pub enabled: bool,

    /// Device sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Decimation exponent, 0..=6
    #[serde(default)]
    pub log2_rate_factor: u8,

    /// RF center frequency in Hz
    #[serde(default = "default_center_frequency")]
    pub center_frequency_hz: i64,

    /// Center-frequency placement within the passband
    #[serde(default = "default_placement")]
    pub placement: Placement,

    /// DC/IQ correction mode
    #[serde(default)]
    pub correction: CorrectionMode,

    /// WAV file path for `WavFile` devices
    #[serde(default)]
    pub wav_path: Option<String>,
}

impl DeviceEntry {
    /// Create a new device entry with a generated UUID
    pub fn new(name: String, kind: DeviceKind, serial: String, enabled: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            kind,
            serial,
            enabled,
            sample_rate: default_sample_rate(),
            log2_rate_factor: 0,
            center_frequency_hz: default_center_frequency(),
            placement: default_placement(),
            correction: CorrectionMode::None,
            wav_path: None,
        }
    }

    /// Create the default test-signal device
    pub fn default_test_signal() -> Self {
        Self::new(
            "Test Signal".to_string(),
            DeviceKind::TestSignal,
            "testsig-0".to_string(),
            true,
        )
    }

    /// Stream settings derived from this entry
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            sample_rate: self.sample_rate,
            log2_rate_factor: self.log2_rate_factor,
            center_frequency: self.center_frequency_hz,
            placement: self.placement,
            correction: self.correction,
            ..Default::default()
        }
        .clamped()
    }
}

/// Legacy configuration format for migration (pre-multi-device)
#[derive(Debug, Default, Serialize, Deserialize)]
struct LegacyAppConfig {
    device_serial: Option<String>,
    sample_rate: Option<u32>,
    center_frequency_hz: Option<i64>,
}

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// List of configured SDR devices
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceEntry>,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    2 // Current schema version
}

fn default_devices() -> Vec<DeviceEntry> {
    vec![DeviceEntry::default_test_signal()]
}

fn default_sample_rate() -> u32 {
    2_000_000
}

fn default_center_frequency() -> i64 {
    100_000_000
}

fn default_placement() -> Placement {
    Placement::AtCenter
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            devices: default_devices(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk with automatic migration from legacy format
    pub fn load() -> Result<Self, confy::ConfyError> {
        let config: AppConfig = confy::load(APP_NAME, CONFIG_NAME)?;

        // Version 0 or 1 indicates the legacy single-device format
        if config.config_version < 2 {
            if let Ok(legacy_config) = Self::try_load_legacy() {
                info!(
                    "migrating from legacy single-device configuration (version {})",
                    config.config_version
                );
                let migrated = Self::migrate_from_legacy(&legacy_config);
                migrated.save()?;
                info!("configuration migrated to version 2");
                return Ok(migrated);
            }
        }

        Ok(config)
    }

    /// Attempt to load legacy configuration format
    fn try_load_legacy() -> Result<LegacyAppConfig, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    /// Migrate from legacy single-device format to multi-device format
    fn migrate_from_legacy(legacy: &LegacyAppConfig) -> Self {
        let mut device = DeviceEntry::default_test_signal();
        if let Some(serial) = &legacy.device_serial {
            device.serial.clone_from(serial);
        }
        if let Some(rate) = legacy.sample_rate {
            device.sample_rate = rate;
        }
        if let Some(frequency) = legacy.center_frequency_hz {
            device.center_frequency_hz = frequency;
        }
        Self {
            config_version: default_config_version(),
            devices: vec![device],
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, CONFIG_NAME, self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }

    /// Get a device by display name
    pub fn get_device(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// First device enabled for startup
    pub fn first_enabled(&self) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_one_enabled_test_device() {
        let config = AppConfig::default();
        assert_eq!(config.config_version, 2);
        let device = config.first_enabled().unwrap();
        assert_eq!(device.kind, DeviceKind::TestSignal);
    }

    #[test]
    fn test_legacy_migration_carries_fields() {
        let legacy = LegacyAppConfig {
            device_serial: Some("rtl-007".to_string()),
            sample_rate: Some(1_024_000),
            center_frequency_hz: Some(162_550_000),
        };
        let migrated = AppConfig::migrate_from_legacy(&legacy);
        assert_eq!(migrated.config_version, 2);
        assert_eq!(migrated.devices.len(), 1);
        assert_eq!(migrated.devices[0].serial, "rtl-007");
        assert_eq!(migrated.devices[0].sample_rate, 1_024_000);
        assert_eq!(migrated.devices[0].center_frequency_hz, 162_550_000);
    }

    #[test]
    fn test_stream_settings_clamped() {
        let mut device = DeviceEntry::default_test_signal();
        device.log2_rate_factor = 12;
        assert_eq!(device.stream_settings().log2_rate_factor, 6);
    }
}
