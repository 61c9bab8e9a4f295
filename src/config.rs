//! Configuration management for the ecfand daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file
//! that describes the EC register layout of the notebook, its fans and their
//! threshold tables, and daemon behavior.

use crate::{ec::EcTimings, fan_curve::ThresholdBand};
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Main configuration structure for the ecfand daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// lock_timeout_ms: 200
/// sensor:
///   kind: sysfs
/// fan_control:
///   critical_temperature: 90
///   poll_interval_ms: 3000
///   fans:
///     - name: "CPU Fan"
///       read_register: 0x2F
///       write_register: 0x2F
///       min_speed_value: 0
///       max_speed_value: 255
///       thresholds:
///         - { up_threshold: 0, down_threshold: 0, fan_speed_percent: 0 }
///         - { up_threshold: 60, down_threshold: 52, fan_speed_percent: 50 }
///         - { up_threshold: 75, down_threshold: 67, fan_speed_percent: 100 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Length of the temperature moving-average window.
    #[serde(default = "defaults::temperature_filter_window_ms")]
    pub temperature_filter_window_ms: u64,

    /// How long a poll tick or manual request waits for the EC bus.
    #[serde(default = "defaults::lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// How long startup and shutdown writes wait for the EC bus.
    #[serde(default = "defaults::startup_lock_timeout_ms")]
    pub startup_lock_timeout_ms: u64,

    /// Forces a specific EC driver instead of the best platform match.
    #[serde(default)]
    pub ec_driver: Option<String>,

    /// Reads and reports without writing any EC register.
    #[serde(default)]
    pub read_only: bool,

    /// Reloads fan control when the configuration file changes.
    #[serde(default)]
    pub watch_config: bool,

    #[serde(default)]
    pub sensor: SensorCfg,

    /// EC handshake retry and timing knobs.
    #[serde(default)]
    pub ec: EcTimings,

    pub fan_control: FanControlSet,
}

/// Everything the fan control core needs to drive one notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanControlSet {
    /// Above this temperature every fan is forced to full speed.
    pub critical_temperature: f32,

    /// Critical mode ends once the temperature drops below
    /// `critical_temperature - critical_temperature_offset`.
    #[serde(default)]
    pub critical_temperature_offset: f32,

    pub poll_interval_ms: u64,

    /// Fan registers hold 16-bit little-endian values.
    #[serde(default)]
    pub use_word_registers: bool,

    pub fans: Vec<FanConfig>,

    #[serde(default)]
    pub register_writes: Vec<RegisterWrite>,
}

impl FanControlSet {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanConfig {
    /// Human-readable name for this fan.
    #[serde(default)]
    pub name: Option<String>,

    pub read_register: u8,
    pub write_register: u8,

    /// Raw value written for 0%. May be numerically above `max_speed_value`.
    pub min_speed_value: u16,

    /// Raw value written for 100%.
    pub max_speed_value: u16,

    /// Read values use their own range instead of the write range.
    #[serde(default)]
    pub independent_read_min_max: bool,

    #[serde(default)]
    pub min_speed_value_read: u16,

    #[serde(default)]
    pub max_speed_value_read: u16,

    /// Raw value that hands the fan back to the EC firmware.
    #[serde(default)]
    pub reset_value: u16,

    #[serde(default)]
    pub reset_required: bool,

    /// Empty tables fall back to the default two-band table.
    #[serde(default)]
    pub thresholds: Vec<ThresholdBand>,

    #[serde(default)]
    pub percent_overrides: Vec<PercentOverride>,
}

/// Exact raw value for a percentage, bypassing interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentOverride {
    pub percent: u8,
    pub value: u16,
    #[serde(default)]
    pub target: OverrideTarget,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideTarget {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl OverrideTarget {
    pub fn applies_to_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    pub fn applies_to_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }
}

/// One-shot register write tied to a lifecycle occasion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub register: u8,
    pub value: u8,

    #[serde(default)]
    pub reset_value: u8,

    /// Writes `reset_value` when fan control stops.
    #[serde(default)]
    pub reset_required: bool,

    pub occasion: WriteOccasion,

    #[serde(default)]
    pub mode: WriteMode,

    #[serde(default)]
    pub reset_mode: WriteMode,

    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOccasion {
    OnInitialization,
    /// Before every poll tick's fan writes.
    OnWriteFanSpeed,
    OnShutdown,
}

/// How a register write combines with the current register contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Set,
    And,
    Or,
}

/// Temperature source configuration variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SensorCfg {
    /// Kernel thermal zone or hwmon input in millidegrees Celsius.
    Sysfs {
        /// Input file to read. Discovered when absent.
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for SensorCfg {
    fn default() -> Self {
        Self::Sysfs { path: None }
    }
}

/// Longest accepted moving-average window.
pub const MAX_FILTER_WINDOW_MS: u64 = 600_000;

mod defaults {
    pub fn temperature_filter_window_ms() -> u64 {
        6000
    }

    pub fn lock_timeout_ms() -> u64 {
        200
    }

    pub fn startup_lock_timeout_ms() -> u64 {
        2000
    }
}

impl Config {
    pub fn temperature_filter_window(&self) -> Duration {
        Duration::from_millis(self.temperature_filter_window_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn startup_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_lock_timeout_ms)
    }

    /// Checks the configuration for structural consistency.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ecfand::config::Config;
    ///
    /// let yaml = std::fs::read_to_string("/etc/ecfand/config.yml")?;
    /// let config: Config = serde_yaml::from_str(&yaml)?;
    /// config.validate()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn validate(&self) -> Result<()> {
        let set = &self.fan_control;

        if set.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        if set.critical_temperature_offset < 0.0 {
            anyhow::bail!(
                "critical_temperature_offset must not be negative (got {})",
                set.critical_temperature_offset
            );
        }
        if set.fans.is_empty() {
            anyhow::bail!("no fans configured");
        }
        if self.temperature_filter_window_ms > MAX_FILTER_WINDOW_MS {
            anyhow::bail!(
                "temperature_filter_window_ms must be at most {MAX_FILTER_WINDOW_MS} (got {})",
                self.temperature_filter_window_ms
            );
        }

        for (index, fan) in set.fans.iter().enumerate() {
            let label = fan.name.clone().unwrap_or_else(|| format!("#{index}"));

            let mut ups = HashSet::new();
            for band in &fan.thresholds {
                if band.fan_speed_percent > 100 {
                    anyhow::bail!(
                        "Fan '{label}' has a threshold at {}% (max 100)",
                        band.fan_speed_percent
                    );
                }
                if !ups.insert(band.up_threshold) {
                    anyhow::bail!(
                        "Fan '{label}' has duplicate up_threshold {}",
                        band.up_threshold
                    );
                }
            }

            if let Some(o) = fan.percent_overrides.iter().find(|o| o.percent > 100) {
                anyhow::bail!("Fan '{label}' overrides {}% (max 100)", o.percent);
            }

            if set.use_word_registers && (fan.read_register == 0xFF || fan.write_register == 0xFF)
            {
                anyhow::bail!("Fan '{label}' uses register 0xFF, which cannot hold a word");
            }

            if !set.use_word_registers {
                let mut values = vec![
                    ("min_speed_value", fan.min_speed_value),
                    ("max_speed_value", fan.max_speed_value),
                    ("reset_value", fan.reset_value),
                ];
                if fan.independent_read_min_max {
                    values.push(("min_speed_value_read", fan.min_speed_value_read));
                    values.push(("max_speed_value_read", fan.max_speed_value_read));
                }
                values.extend(fan.percent_overrides.iter().map(|o| ("percent_overrides", o.value)));

                if let Some((field, value)) = values.iter().find(|(_, v)| *v > u16::from(u8::MAX)) {
                    anyhow::bail!(
                        "Fan '{label}' {field} {value} does not fit a byte register (use_word_registers is off)"
                    );
                }
            }
        }

        Ok(())
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("ECFAND_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("ecfand/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/ecfand/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    anyhow::bail!("Configuration file not found in any standard location")
}

/// Configuration manager that handles both config data and file operations.
///
/// # Example
///
/// ```no_run
/// use ecfand::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let poll = config_manager.get().await.fan_control.poll_interval_ms;
///
/// config_manager.reload().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. ECFAND_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/ecfand/config.yml or ~/.config/ecfand/config.yml
    /// 4. /etc/ecfand/config.yml
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path).await?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads configuration from the same file.
    ///
    /// The current configuration is kept if the file fails to load.
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading config from: {}", self.path.display());
        let new_config = Self::load_config_from_path(&self.path).await?;

        *self.config.write().await = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    async fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            anyhow::bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
