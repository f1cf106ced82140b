//! Configuration management for the mbpfand daemon.
//!
//! Tunable parameters start from built-in defaults and are overlaid, one field
//! at a time, by whatever the configuration file provides. A file that is
//! missing, unreadable or malformed never stops the daemon; the parameters
//! already in effect simply stay in effect.

use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde_yaml::Value;
use std::{
    env, fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

/// Section holding every tunable the daemon reads.
pub const GENERAL_SECTION: &str = "general";

/// Tunable parameters consumed by the control algorithm.
///
/// Speeds are in fan duty units, temperatures in whole degrees Celsius and the
/// polling interval in seconds.
///
/// # Example
///
/// ```yaml
/// general:
///   min_fan_speed: 2000
///   max_fan_speed: 6200
///   low_temp: 63
///   high_temp: 66
///   max_temp: 86
///   polling_interval: 1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Speed used at or below `low_temp`.
    pub min_fan_speed: i64,

    /// Speed used at or above `max_temp`.
    pub max_fan_speed: i64,

    /// Temperature at or below which fans run at minimum speed.
    pub low_temp: i64,

    /// Temperature above which fans start ramping up.
    pub high_temp: i64,

    /// Temperature at or above which fans run at full speed.
    pub max_temp: i64,

    /// Seconds between two control ticks.
    pub polling_interval: u64,
}

mod defaults {
    pub const MIN_FAN_SPEED: i64 = 0;
    pub const MAX_FAN_SPEED: i64 = 5600;
    pub const LOW_TEMP: i64 = 35;
    pub const HIGH_TEMP: i64 = 45;
    pub const MAX_TEMP: i64 = 55;
    pub const POLLING_INTERVAL: u64 = 2;
}

/// Accepted temperatures, in degrees Celsius.
const TEMP_RANGE: RangeInclusive<i64> = 0..=150;

/// Accepted fan speeds.
const SPEED_RANGE: RangeInclusive<i64> = 0..=20_000;

/// Accepted polling intervals, in seconds.
const POLLING_RANGE: RangeInclusive<i64> = 1..=3600;

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_fan_speed: defaults::MIN_FAN_SPEED,
            max_fan_speed: defaults::MAX_FAN_SPEED,
            low_temp: defaults::LOW_TEMP,
            high_temp: defaults::HIGH_TEMP,
            max_temp: defaults::MAX_TEMP,
            polling_interval: defaults::POLLING_INTERVAL,
        }
    }
}

impl Settings {
    /// Time to sleep between two control ticks.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }

    /// Checks every field against its range and the ordering between fields.
    pub fn validate(&self) -> Result<()> {
        check_speeds(self.min_fan_speed, self.max_fan_speed)?;
        check_temps(self.low_temp, self.high_temp, self.max_temp)?;

        let interval = i64::try_from(self.polling_interval).unwrap_or(i64::MAX);
        if !POLLING_RANGE.contains(&interval) {
            bail!(
                "polling_interval ({}) must be within {POLLING_RANGE:?} seconds",
                self.polling_interval
            );
        }

        Ok(())
    }

    /// Returns these settings overlaid with the fields found in `store`.
    ///
    /// Absent, non-numeric or out-of-range fields keep their current value.
    /// Fields that depend on each other are applied as a group: the speed
    /// pair and the temperature triple each fall back to their current
    /// values when the update would break their ordering, without affecting
    /// the other fields.
    pub fn merged_with(&self, store: &dyn SettingsStore) -> Settings {
        let mut next = *self;
        let field = |key: &str, range: &RangeInclusive<i64>| read_field(store, key, range);

        let min_speed = field("min_fan_speed", &SPEED_RANGE);
        let max_speed = field("max_fan_speed", &SPEED_RANGE);
        if min_speed.is_some() || max_speed.is_some() {
            let min = min_speed.unwrap_or(self.min_fan_speed);
            let max = max_speed.unwrap_or(self.max_fan_speed);
            match check_speeds(min, max) {
                Ok(()) => {
                    next.min_fan_speed = min;
                    next.max_fan_speed = max;
                }
                Err(e) => warn!("Ignoring fan speed update: {e}"),
            }
        }

        let low = field("low_temp", &TEMP_RANGE);
        let high = field("high_temp", &TEMP_RANGE);
        let max = field("max_temp", &TEMP_RANGE);
        if low.is_some() || high.is_some() || max.is_some() {
            let low = low.unwrap_or(self.low_temp);
            let high = high.unwrap_or(self.high_temp);
            let max = max.unwrap_or(self.max_temp);
            match check_temps(low, high, max) {
                Ok(()) => {
                    next.low_temp = low;
                    next.high_temp = high;
                    next.max_temp = max;
                }
                Err(e) => warn!("Ignoring temperature update: {e}"),
            }
        }

        if let Some(v) = field("polling_interval", &POLLING_RANGE) {
            next.polling_interval = v.unsigned_abs();
        }

        next
    }
}

fn check_speeds(min: i64, max: i64) -> Result<()> {
    if !(SPEED_RANGE.contains(&min) && SPEED_RANGE.contains(&max)) {
        bail!("fan speeds ({min} / {max}) must be within {SPEED_RANGE:?}");
    }
    if max <= min {
        bail!("max_fan_speed ({max}) must be greater than min_fan_speed ({min})");
    }
    Ok(())
}

fn check_temps(low: i64, high: i64, max: i64) -> Result<()> {
    if ![low, high, max].iter().all(|t| TEMP_RANGE.contains(t)) {
        bail!("temperatures ({low} / {high} / {max}) must be within {TEMP_RANGE:?}");
    }
    if !(low < high && high < max) {
        bail!("temperatures must satisfy low_temp < high_temp < max_temp (got {low} / {high} / {max})");
    }
    Ok(())
}

fn read_field(store: &dyn SettingsStore, key: &str, range: &RangeInclusive<i64>) -> Option<i64> {
    let value = store.get_int(GENERAL_SECTION, key)?;
    if range.contains(&value) {
        Some(value)
    } else {
        warn!("Ignoring out-of-range value {value} for {GENERAL_SECTION}.{key}, expected {range:?}");
        None
    }
}

/// Read access to a sectioned key/value configuration source.
#[cfg_attr(test, mockall::automock)]
pub trait SettingsStore: Send + Sync {
    /// Returns the integer stored under `section.key`, or `None` when the key
    /// is absent or its value is not an integer.
    fn get_int(&self, section: &str, key: &str) -> Option<i64>;
}

/// Settings store backed by a YAML document of `section: { key: value }` maps.
#[derive(Debug, Clone, Default)]
pub struct YamlSettings {
    root: Value,
}

impl YamlSettings {
    /// Parses a YAML document. An empty document yields an empty store.
    pub fn parse(content: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        match root {
            Value::Mapping(_) | Value::Null => Ok(Self { root }),
            _ => bail!("configuration root must be a mapping of sections"),
        }
    }

    /// Reads and parses the file at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }
}

impl SettingsStore for YamlSettings {
    fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        match self.root.get(section)?.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn locate_config() -> Option<PathBuf> {
    if let Ok(env_path) = env::var("MBPFAND_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("mbpfand/config.yml");
        if cfg_dir.exists() {
            return Some(cfg_dir);
        }
    }

    let etc = Path::new("/etc/mbpfand/config.yml");
    etc.exists().then(|| etc.to_path_buf())
}

/// Owns the live tunable parameters and knows where to re-read them from.
///
/// Cloning is cheap and every clone shares the same parameters, so the
/// control loop and the reload path always agree on what is in effect.
///
/// # Example
///
/// ```no_run
/// use mbpfand::config::ConfigManager;
///
/// # async fn example() {
/// let config_manager = ConfigManager::load(None).await;
/// let interval = config_manager.snapshot().await.polling_interval();
///
/// if let Err(e) = config_manager.reload().await {
///     log::warn!("{e:#}");
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    settings: Arc<RwLock<Settings>>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a manager holding `settings`, reading updates from `path`.
    ///
    /// Without a path, every reload searches the standard locations.
    pub fn new(settings: Settings, path: Option<PathBuf>) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            path,
        }
    }

    /// Builds a manager from the defaults overlaid with the configuration file.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. MBPFAND_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/mbpfand/config.yml or ~/.config/mbpfand/config.yml
    /// 4. /etc/mbpfand/config.yml
    pub async fn load(path: Option<PathBuf>) -> Self {
        let manager = Self::new(Settings::default(), path);
        if let Err(e) = manager.reload().await {
            warn!("{e:#}");
            info!("Using default parameters");
        }
        manager
    }

    /// Copies the current parameters.
    pub async fn snapshot(&self) -> Settings {
        *self.settings.read().await
    }

    /// Re-reads the configuration file and applies it on top of the live
    /// parameters.
    ///
    /// On error nothing has changed.
    pub async fn reload(&self) -> Result<Settings> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => locate_config().context("Configuration file not found in any standard location")?,
        };

        info!("Reading config from: {}", path.display());
        let store = YamlSettings::read(&path)?;
        Ok(self.apply(&store).await)
    }

    /// Applies every valid field of `store` to the live parameters.
    pub async fn apply(&self, store: &dyn SettingsStore) -> Settings {
        let mut settings = self.settings.write().await;
        let next = settings.merged_with(store);
        if next != *settings {
            info!("Parameters updated: {next:?}");
        }
        *settings = next;
        next
    }
}
