//! Configuration management for the daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and connection parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{AapError, Result};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// This host's link address, announced during ownership negotiation.
   #[serde(default)]
   pub self_address: Option<String>,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_ms: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_debounce")]
   pub debounce_ms: u64,

   #[serde(default = "default_true")]
   pub auto_reconnect: bool,

   /// Listener registrations normally die with the link; subscribers must
   /// re-register after a reconnect unless this is set.
   #[serde(default)]
   pub keep_listeners_on_disconnect: bool,
}

/// Represents a known accessory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_retry_count() -> u32 {
   3
}

const fn default_reconnect_delay() -> u64 {
   2000
}

const fn default_connect_timeout() -> u64 {
   5000
}

const fn default_debounce() -> u64 {
   100
}

const fn default_true() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         self_address: None,
         connection_retry_count: default_retry_count(),
         reconnect_delay_ms: default_reconnect_delay(),
         connect_timeout_ms: default_connect_timeout(),
         debounce_ms: default_debounce(),
         auto_reconnect: default_true(),
         keep_listeners_on_disconnect: false,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("AACPD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home).join("aacpd")
      } else if let Some(config_home) = dirs::config_dir() {
         config_home.join("aacpd")
      } else {
         return Err(AapError::ConfigDirNotFound);
      };

      Ok(config_dir.join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }
}
