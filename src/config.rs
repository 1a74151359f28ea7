// Copyright 2026 Proxitoken Team
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

//! Configuration file handling.
//!
//! Settings live in `config.toml` under the user's config directory. A
//! missing file yields the defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::bluetooth::ble_constants::config as defaults;
use crate::bluetooth::BluezOptions;

/// RSSI sampling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RssiConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RssiConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::RSSI_POLL_INTERVAL_MS,
            max_attempts: defaults::RSSI_MAX_ATTEMPTS,
        }
    }
}

impl RssiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adapter to use (e.g. `hci0`); unset picks the default adapter.
    pub adapter: Option<String>,
    /// Name advertised to peers.
    pub device_name: String,
    pub advertise: bool,
    /// Hex-encoded token served on reads. Empty generates a random one per run.
    pub token: String,
    pub connection_poll_interval_ms: u64,
    /// Upper bound on a reassembled write.
    pub max_value_len: usize,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    // Kept last: TOML tables must follow plain values.
    pub rssi: RssiConfig,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            adapter: None,
            device_name: hostname,
            advertise: true,
            token: String::new(),
            connection_poll_interval_ms: defaults::CONNECTION_POLL_INTERVAL_MS,
            max_value_len: defaults::MAX_VALUE_LEN,
            log_filter: "info".to_string(),
            rssi: RssiConfig::default(),
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/proxitoken/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(dir.join("proxitoken").join("config.toml"))
    }

    /// Load from `path`, falling back to defaults when it doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {:?} doesn't exist, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        debug!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_value_len == 0 || self.max_value_len > defaults::MAX_VALUE_LEN {
            bail!(
                "max_value_len must be between 1 and {}, got {}",
                defaults::MAX_VALUE_LEN,
                self.max_value_len
            );
        }
        if let Some(token) = self.token_bytes()? {
            if token.len() > self.max_value_len {
                bail!(
                    "token is {} bytes, longer than max_value_len {}",
                    token.len(),
                    self.max_value_len
                );
            }
        }
        Ok(())
    }

    /// Decoded configured token, `None` when unset.
    pub fn token_bytes(&self) -> Result<Option<Vec<u8>>> {
        let token = self.token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        let bytes = hex::decode(token).context("token must be a hex string")?;
        Ok(Some(bytes))
    }

    pub fn bluez_options(&self) -> BluezOptions {
        BluezOptions {
            adapter: self.adapter.clone(),
            device_name: self.device_name.clone(),
            advertise: self.advertise,
            connection_poll_interval: Duration::from_millis(self.connection_poll_interval_ms),
        }
    }
}
