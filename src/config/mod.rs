//! Configuration management for the DAC gateway
//!
//! Handles loading, validating and hot-reloading the YAML configuration.
//! Out-of-range values are clamped with a warning; only input the gateway
//! cannot run with at all is rejected.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

pub use watcher::ConfigWatcher;

use crate::controller::ControllerSettings;
use crate::dac::bus::{BusSettings, DEFAULT_BUS_TIMEOUT_MS, DEFAULT_THROTTLE_MS};
use crate::dac::filters::{FilterSettings, DPLL_MAX};
use crate::dac::registers::DEFAULT_ADDRESS;
use crate::dac::volume::{VolumeCurve, MAX_BALANCE};
use crate::feed::FeedSettings;
use crate::sequencer::{SequencerSettings, DEFAULT_SEEK_MUTE_MS, MAX_SEEK_MUTE_MS, RAMP_STEPS_RANGE};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub mute: MuteConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Raise the default log filter to `debug`
    #[serde(default)]
    pub debug_logging: bool,
}

/// Bus and chip configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_bus")]
    pub bus: u8,
    #[serde(default = "default_address")]
    pub address: u8,
    #[serde(default)]
    pub bus_tool: BusToolConfig,
    /// Minimum gap between bus operations
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    /// Budget for a single bus transaction
    #[serde(default = "default_bus_timeout_ms")]
    pub bus_timeout_ms: u64,
    #[serde(default)]
    pub volume_curve: CurveKind,
    /// Quietest audible attenuation of the restricted curve
    #[serde(default = "default_min_gain")]
    pub min_gain: u8,
    /// Attenuation used for volume 0 by the restricted curve
    #[serde(default = "default_mute_byte")]
    pub mute_byte: u8,
}

/// Paths of the command line bus tools
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BusToolConfig {
    #[serde(default = "default_i2cget")]
    pub i2cget: String,
    #[serde(default = "default_i2cset")]
    pub i2cset: String,
}

/// Volume curve selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    #[default]
    Linear,
    Restricted,
}

/// Mute and ramp behavior
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MuteConfig {
    /// Hold time of the seek mute, 0..=2000
    #[serde(default = "default_seek_mute_ms")]
    pub seek_mute_ms: u64,
    #[serde(default)]
    pub graceful_mute: bool,
    #[serde(default)]
    pub graceful_volume: bool,
    /// Fade steps, 1..=5
    #[serde(default = "default_ramp_steps")]
    pub ramp_steps: u8,
    #[serde(default = "default_ramp_step_ms")]
    pub ramp_step_ms: u64,
}

/// Volume, balance and filter selections
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AudioConfig {
    /// -40..=40, positive attenuates the left channel
    #[serde(default)]
    pub balance: i32,
    /// Volume used at startup until the engine reports one
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(flatten)]
    pub filters: FilterSettings,
}

/// Playback engine connection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub url: String,
    /// HTTP endpoint returning the state snapshot, polled while the
    /// socket is down. Empty or null disables the poll.
    #[serde(default = "default_state_url")]
    pub state_url: Option<String>,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// Continuous disconnection before the fallback poll starts
    #[serde(default = "default_degraded_after_ms")]
    pub degraded_after_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Clamp out-of-range values and reject unusable ones
    pub fn validate(&mut self) -> Result<()> {
        if self.engine.url.trim().is_empty() {
            anyhow::bail!("engine.url cannot be empty");
        }
        self.engine.state_url = self
            .engine
            .state_url
            .take()
            .filter(|url| !url.trim().is_empty());
        if self.device.address > 0x7F {
            anyhow::bail!(
                "device.address {:#04x} is not a 7-bit bus address",
                self.device.address
            );
        }
        if self.device.bus_tool.i2cget.is_empty() || self.device.bus_tool.i2cset.is_empty() {
            anyhow::bail!("device.bus_tool paths cannot be empty");
        }

        let device = &mut self.device;
        if device.bus_timeout_ms == 0 {
            warn!("device.bus_timeout_ms is 0, using {}", DEFAULT_BUS_TIMEOUT_MS);
            device.bus_timeout_ms = DEFAULT_BUS_TIMEOUT_MS;
        }
        if device.volume_curve == CurveKind::Restricted && device.mute_byte < device.min_gain {
            warn!(
                "device.mute_byte {:#04x} is louder than min_gain {:#04x}, using min_gain",
                device.mute_byte, device.min_gain
            );
            device.mute_byte = device.min_gain;
        }

        clamp_warn("mute.seek_mute_ms", &mut self.mute.seek_mute_ms, 0, MAX_SEEK_MUTE_MS);
        clamp_warn(
            "mute.ramp_steps",
            &mut self.mute.ramp_steps,
            *RAMP_STEPS_RANGE.start(),
            *RAMP_STEPS_RANGE.end(),
        );
        clamp_warn("audio.balance", &mut self.audio.balance, -MAX_BALANCE, MAX_BALANCE);
        clamp_warn("audio.volume", &mut self.audio.volume, 0, 100);
        clamp_warn("audio.dpll_i2s", &mut self.audio.filters.dpll_i2s, 0, DPLL_MAX);
        clamp_warn("audio.dpll_dsd", &mut self.audio.filters.dpll_dsd, 0, DPLL_MAX);

        let engine = &mut self.engine;
        clamp_warn("engine.reconnect_cap_ms", &mut engine.reconnect_cap_ms, 1000, u64::MAX);
        clamp_warn("engine.poll_interval_ms", &mut engine.poll_interval_ms, 1000, u64::MAX);

        Ok(())
    }

    pub fn volume_curve(&self) -> VolumeCurve {
        match self.device.volume_curve {
            CurveKind::Linear => VolumeCurve::Linear,
            CurveKind::Restricted => VolumeCurve::Restricted {
                min_gain: self.device.min_gain,
                mute_byte: self.device.mute_byte,
            },
        }
    }

    pub fn sequencer_settings(&self) -> SequencerSettings {
        SequencerSettings {
            seek_mute: Duration::from_millis(self.mute.seek_mute_ms),
            graceful_mute: self.mute.graceful_mute,
            graceful_volume: self.mute.graceful_volume,
            ramp_steps: self.mute.ramp_steps,
            ramp_step: Duration::from_millis(self.mute.ramp_step_ms),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            bus: self.device.bus,
            address: self.device.address,
            curve: self.volume_curve(),
            sequencer: self.sequencer_settings(),
            balance: self.audio.balance,
            initial_volume: self.audio.volume,
            filters: self.audio.filters,
        }
    }

    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            throttle: Duration::from_millis(self.device.throttle_ms),
            timeout: Duration::from_millis(self.device.bus_timeout_ms),
        }
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            reconnect_cap: Duration::from_millis(self.engine.reconnect_cap_ms),
            degraded_after: Duration::from_millis(self.engine.degraded_after_ms),
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
        }
    }
}

fn clamp_warn<T: PartialOrd + Copy + Display>(name: &str, value: &mut T, min: T, max: T) {
    let clamped = if *value < min {
        min
    } else if *value > max {
        max
    } else {
        return;
    };
    warn!("{} = {} out of range, using {}", name, value, clamped);
    *value = clamped;
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bus: default_bus(),
            address: default_address(),
            bus_tool: BusToolConfig::default(),
            throttle_ms: default_throttle_ms(),
            bus_timeout_ms: default_bus_timeout_ms(),
            volume_curve: CurveKind::default(),
            min_gain: default_min_gain(),
            mute_byte: default_mute_byte(),
        }
    }
}

impl Default for BusToolConfig {
    fn default() -> Self {
        Self {
            i2cget: default_i2cget(),
            i2cset: default_i2cset(),
        }
    }
}

impl Default for MuteConfig {
    fn default() -> Self {
        Self {
            seek_mute_ms: default_seek_mute_ms(),
            graceful_mute: false,
            graceful_volume: false,
            ramp_steps: default_ramp_steps(),
            ramp_step_ms: default_ramp_step_ms(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            balance: 0,
            volume: default_volume(),
            filters: FilterSettings::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            state_url: default_state_url(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            degraded_after_ms: default_degraded_after_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_bus() -> u8 { 1 }
fn default_address() -> u8 { DEFAULT_ADDRESS }
fn default_i2cget() -> String { "i2cget".to_string() }
fn default_i2cset() -> String { "i2cset".to_string() }
fn default_throttle_ms() -> u64 { DEFAULT_THROTTLE_MS }
fn default_bus_timeout_ms() -> u64 { DEFAULT_BUS_TIMEOUT_MS }
fn default_min_gain() -> u8 { 0xA0 }
fn default_mute_byte() -> u8 { 0xFF }
fn default_seek_mute_ms() -> u64 { DEFAULT_SEEK_MUTE_MS }
fn default_ramp_steps() -> u8 { 3 }
fn default_ramp_step_ms() -> u64 { 40 }
fn default_volume() -> u8 { 50 }
fn default_engine_url() -> String { "ws://localhost:3000/ws".to_string() }
fn default_state_url() -> Option<String> { Some("http://localhost:3000/api/v1/getState".to_string()) }
fn default_reconnect_cap_ms() -> u64 { 30_000 }
fn default_degraded_after_ms() -> u64 { 300_000 }
fn default_poll_interval_ms() -> u64 { 60_000 }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dac::filters::{Deemphasis, FirFilter};
    use tempfile::TempDir;

    fn parse(yaml: &str) -> Result<AppConfig> {
        let mut config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = parse("{}").unwrap();
        assert_eq!(config.device.bus, 1);
        assert_eq!(config.device.address, 0x48);
        assert_eq!(config.mute.seek_mute_ms, DEFAULT_SEEK_MUTE_MS);
        assert_eq!(config.volume_curve(), VolumeCurve::Linear);
        assert_eq!(config.controller_settings(), ControllerSettings::default());
        assert_eq!(config.feed_settings(), FeedSettings::default());
        assert_eq!(config.bus_settings(), BusSettings::default());
    }

    #[test]
    fn test_sections_parse() {
        let config = parse(
            r#"
device:
  bus: 0
  address: 0x49
  volume_curve: restricted
  min_gain: 0x90
  mute_byte: 0xFE
  bus_tool:
    i2cget: /usr/sbin/i2cget
mute:
  seek_mute_ms: 450
  graceful_mute: true
  ramp_steps: 4
audio:
  balance: -12
  volume: 35
  fir_filter: slow
  deemphasis: 48k
  dpll_i2s: 7
engine:
  url: ws://volumio.local:3000/ws
  state_url: http://volumio.local:3000/api/v1/getState
  poll_interval_ms: 30000
debug_logging: true
"#,
        )
        .unwrap();

        assert_eq!(config.device.address, 0x49);
        assert_eq!(config.device.bus_tool.i2cget, "/usr/sbin/i2cget");
        assert_eq!(config.device.bus_tool.i2cset, "i2cset");
        assert_eq!(
            config.volume_curve(),
            VolumeCurve::Restricted {
                min_gain: 0x90,
                mute_byte: 0xFE
            }
        );

        let settings = config.controller_settings();
        assert_eq!(settings.balance, -12);
        assert_eq!(settings.initial_volume, 35);
        assert_eq!(settings.sequencer.seek_mute, Duration::from_millis(450));
        assert!(settings.sequencer.graceful_mute);
        assert_eq!(settings.sequencer.ramp_steps, 4);
        assert_eq!(settings.filters.fir_filter, FirFilter::Slow);
        assert_eq!(settings.filters.deemphasis, Deemphasis::K48);
        assert_eq!(settings.filters.dpll_i2s, 7);
        assert_eq!(settings.filters.dpll_dsd, 10);
        assert_eq!(config.feed_settings().poll_interval, Duration::from_secs(30));
        assert_eq!(
            config.engine.state_url.as_deref(),
            Some("http://volumio.local:3000/api/v1/getState")
        );
        assert!(config.debug_logging);
    }

    #[test]
    fn test_state_url_default_and_disable() {
        let config = parse("engine:\n  url: ws://volumio.local:3000/ws\n").unwrap();
        assert_eq!(
            config.engine.state_url.as_deref(),
            Some("http://localhost:3000/api/v1/getState")
        );

        let config = parse("engine:\n  state_url: \"\"\n").unwrap();
        assert_eq!(config.engine.state_url, None);
        let config = parse("engine:\n  state_url: ~\n").unwrap();
        assert_eq!(config.engine.state_url, None);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let config = parse(
            r#"
device:
  volume_curve: restricted
  min_gain: 0xC0
  mute_byte: 0x10
mute:
  seek_mute_ms: 9000
  ramp_steps: 0
audio:
  balance: 99
  volume: 180
  dpll_dsd: 31
"#,
        )
        .unwrap();

        assert_eq!(config.mute.seek_mute_ms, MAX_SEEK_MUTE_MS);
        assert_eq!(config.mute.ramp_steps, 1);
        assert_eq!(config.audio.balance, MAX_BALANCE);
        assert_eq!(config.audio.volume, 100);
        assert_eq!(config.audio.filters.dpll_dsd, DPLL_MAX);
        assert_eq!(config.device.mute_byte, 0xC0);
    }

    #[test]
    fn test_unusable_values_are_rejected() {
        assert!(parse("engine:\n  url: \"\"\n").is_err());
        assert!(parse("device:\n  address: 0x90\n").is_err());
        assert!(parse("device:\n  volume_curve: logarithmic\n").is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dac.yaml");
        let path = path.to_string_lossy().to_string();

        let mut config = AppConfig::default();
        config.audio.balance = 5;
        config.audio.filters.fir_filter = FirFilter::Minimum;
        config.mute.graceful_volume = true;
        config.save(&path).await?;

        let loaded = AppConfig::load(&path).await?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(AppConfig::load(&path.to_string_lossy()).await.is_err());
    }
}
