//! Configuration management for the podlink service.
//!
//! This module handles loading and saving user preferences, reconciler
//! tunables and transport parameters from a TOML file on disk.

use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{PodError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
   /// Address of the paired device the service follows.
   #[serde(default)]
   pub bound_device: Option<String>,

   #[serde(default = "default_rssi_min")]
   pub rssi_min: i16,

   #[serde(default)]
   pub automatic_ear_detection: bool,

   #[serde(default)]
   pub conversational_awareness: bool,

   #[serde(default = "default_ca_volume")]
   pub conversational_awareness_volume_percent: u8,

   #[serde(default)]
   pub personalized_volume: bool,

   #[serde(default)]
   pub loud_sound_reduction: bool,

   #[serde(default = "default_transparency_level")]
   pub adaptive_transparency_level: u8,

   #[serde(default)]
   pub reconciler: ReconcilerConfig,

   #[serde(default)]
   pub transport: TransportConfig,
}

/// Plausibility thresholds and timer durations for advertisement tracking.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
   #[serde(default = "default_battery_step_max")]
   pub battery_step_max: u8,

   #[serde(default = "default_rssi_delta_max")]
   pub rssi_delta_max: i16,

   #[serde(default = "default_timeout_secs")]
   pub lost_timeout_secs: u64,

   #[serde(default = "default_timeout_secs")]
   pub stale_timeout_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_secs: u64,

   #[serde(default = "default_settle_delay")]
   pub settle_delay_ms: u64,

   #[serde(default = "default_driver_dir")]
   pub driver_device_dir: PathBuf,

   #[serde(default = "default_driver_prefix")]
   pub driver_device_prefix: String,

   /// RFCOMM channel used by the driver's platform-service path.
   #[serde(default)]
   pub driver_rfcomm_channel: Option<u8>,
}

const fn default_rssi_min() -> i16 {
   -80
}

const fn default_ca_volume() -> u8 {
   40
}

const fn default_transparency_level() -> u8 {
   25
}

const fn default_battery_step_max() -> u8 {
   1
}

const fn default_rssi_delta_max() -> i16 {
   50
}

const fn default_timeout_secs() -> u64 {
   10
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_settle_delay() -> u64 {
   100
}

fn default_driver_dir() -> PathBuf {
   PathBuf::from("/dev")
}

fn default_driver_prefix() -> String {
   "magicaap".into()
}

/// Lower bound of the ducking volume while the wearer is speaking.
pub const CA_VOLUME_MIN: u8 = 10;
pub const CA_VOLUME_MAX: u8 = 100;

impl Default for ReconcilerConfig {
   fn default() -> Self {
      Self {
         battery_step_max: default_battery_step_max(),
         rssi_delta_max: default_rssi_delta_max(),
         lost_timeout_secs: default_timeout_secs(),
         stale_timeout_secs: default_timeout_secs(),
      }
   }
}

impl ReconcilerConfig {
   pub const fn lost_timeout(&self) -> Duration {
      Duration::from_secs(self.lost_timeout_secs)
   }

   pub const fn stale_timeout(&self) -> Duration {
      Duration::from_secs(self.stale_timeout_secs)
   }
}

impl Default for TransportConfig {
   fn default() -> Self {
      Self {
         connect_timeout_secs: default_connect_timeout(),
         settle_delay_ms: default_settle_delay(),
         driver_device_dir: default_driver_dir(),
         driver_device_prefix: default_driver_prefix(),
         driver_rfcomm_channel: None,
      }
   }
}

impl TransportConfig {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }

   pub const fn settle_delay(&self) -> Duration {
      Duration::from_millis(self.settle_delay_ms)
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         bound_device: None,
         rssi_min: default_rssi_min(),
         automatic_ear_detection: false,
         conversational_awareness: false,
         conversational_awareness_volume_percent: default_ca_volume(),
         personalized_volume: false,
         loud_sound_reduction: false,
         adaptive_transparency_level: default_transparency_level(),
         reconciler: ReconcilerConfig::default(),
         transport: TransportConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         let mut config: Self = toml::from_str(&contents)?;
         config.normalize();
         Ok(config)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   /// Clamps values a hand-edited file may have pushed out of range.
   pub fn normalize(&mut self) {
      self.conversational_awareness_volume_percent = self
         .conversational_awareness_volume_percent
         .clamp(CA_VOLUME_MIN, CA_VOLUME_MAX);
      self.adaptive_transparency_level = self
         .adaptive_transparency_level
         .min(crate::airpods::protocol::ADAPTIVE_TRANSPARENCY_MAX);
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("PODLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(PodError::ConfigDirNotFound);
      };

      Ok(config_dir.join("podlinkd").join("config.toml"))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn missing_file_is_created_with_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
   }

   #[test]
   fn preferences_survive_a_save() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let mut config = Config::default();
      config.bound_device = Some("AA:BB:CC:DD:EE:FF".into());
      config.conversational_awareness = true;
      config.transport.driver_rfcomm_channel = Some(3);
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded, config);
   }

   #[test]
   fn partial_file_falls_back_to_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         "rssi_min = -70\nconversational_awareness_volume_percent = 3\n[reconciler]\nrssi_delta_max = 30\n",
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.rssi_min, -70);
      assert_eq!(config.conversational_awareness_volume_percent, CA_VOLUME_MIN);
      assert_eq!(config.reconciler.rssi_delta_max, 30);
      assert_eq!(config.reconciler.battery_step_max, 1);
      assert_eq!(config.reconciler.lost_timeout(), Duration::from_secs(10));
      assert_eq!(config.adaptive_transparency_level, 25);
      assert_eq!(config.transport.driver_device_prefix, "magicaap");
   }
}
