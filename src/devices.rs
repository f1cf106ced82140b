//! Sensor and fan discovery on top of the sysfs files exposed by applesmc.
//!
//! Every handle is opened once during discovery and held for the lifetime of
//! the registry. Reads and writes are positional at offset 0, so the same
//! handle can be polled forever without seeking.

use std::{
    fs::{File, OpenOptions},
    io,
    ops::Range,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use anyhow::{Result, bail};
use log::{debug, info, warn};

use crate::control;

/// Platform directory applesmc publishes its attributes under.
pub const APPLESMC_DIR: &str = "/sys/devices/platform/applesmc.768";

/// Sensor indices probed during discovery; applesmc reports the processor
/// temperature as `temp3`.
pub const SENSOR_INDICES: Range<u32> = 3..4;

/// Fan indices probed during discovery.
pub const FAN_INDICES: Range<u32> = 1..7;

const READ_BUF_LEN: usize = 16;

/// Directories searched for sensor and fan attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    pub sensor_dir: PathBuf,
    pub fan_dir: PathBuf,
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self {
            sensor_dir: PathBuf::from(APPLESMC_DIR),
            fan_dir: PathBuf::from(APPLESMC_DIR),
        }
    }
}

impl DevicePaths {
    /// Uses `dir` for both sensors and fans.
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            sensor_dir: dir.clone(),
            fan_dir: dir,
        }
    }
}

/// A temperature input with its cached milli-degree reading.
#[derive(Debug)]
pub struct Sensor {
    input: File,
    input_path: PathBuf,
    label: Option<String>,
    millidegrees: i64,
}

impl Sensor {
    fn open(dir: &Path, index: u32) -> Option<Self> {
        let input_path = dir.join(format!("temp{index}_input"));
        let input = File::open(&input_path).ok()?;

        let label = std::fs::read_to_string(dir.join(format!("temp{index}_label")))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut sensor = Self {
            input,
            input_path,
            label,
            millidegrees: 0,
        };
        sensor.read_temperature();
        Some(sensor)
    }

    /// Re-reads the input and returns the cached value.
    ///
    /// A read that fails or yields no leading integer leaves the previous
    /// value in place.
    pub fn read_temperature(&mut self) -> i64 {
        let mut buf = [0u8; READ_BUF_LEN];
        match self.input.read_at(&mut buf, 0) {
            Ok(len) => match parse_leading_int(&buf[..len]) {
                Some(value) => self.millidegrees = value,
                None => warn!(
                    "Unparsable reading from {}, keeping {}",
                    self.input_path.display(),
                    self.millidegrees
                ),
            },
            Err(e) => warn!(
                "Failed to read {}: {e}, keeping {}",
                self.input_path.display(),
                self.millidegrees
            ),
        }
        self.millidegrees
    }

    /// Last value read, in milli-degrees Celsius.
    pub fn millidegrees(&self) -> i64 {
        self.millidegrees
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.input_path
    }
}

/// A fan output with the path of its manual-mode toggle.
#[derive(Debug)]
pub struct Fan {
    output: File,
    output_path: PathBuf,
    manual_path: PathBuf,
}

impl Fan {
    fn open(dir: &Path, index: u32) -> Option<Self> {
        let output_path = dir.join(format!("fan{index}_output"));
        let output = OpenOptions::new().write(true).open(&output_path).ok()?;

        Some(Self {
            output,
            output_path,
            manual_path: dir.join(format!("fan{index}_manual")),
        })
    }

    /// Writes `value` as decimal text at offset 0 of the output.
    pub fn write_speed(&self, value: i64) -> io::Result<()> {
        self.output.write_at(value.to_string().as_bytes(), 0).map(|_| ())
    }

    /// Writes the manual toggle and closes it again straight away.
    pub fn set_manual(&self, manual: bool) -> io::Result<()> {
        let mut toggle = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.manual_path)?;
        io::Write::write_all(&mut toggle, if manual { b"1" } else { b"0" })
    }

    pub fn path(&self) -> &Path {
        &self.output_path
    }

    pub fn manual_path(&self) -> &Path {
        &self.manual_path
    }
}

/// Probes `SENSOR_INDICES` under `dir`, in ascending order.
pub fn discover_sensors(dir: &Path) -> Result<Vec<Sensor>> {
    info!("Looking for temperature sensors under {}", dir.display());

    let sensors: Vec<Sensor> = SENSOR_INDICES
        .filter_map(|index| {
            debug!("Checking temperature sensor temp{index}");
            Sensor::open(dir, index)
        })
        .inspect(|sensor| {
            info!(
                "Found sensor {} ({}) at {} m°C",
                sensor.path().display(),
                sensor.label().unwrap_or("unlabelled"),
                sensor.millidegrees()
            )
        })
        .collect();

    info!("Found {} temperature sensors", sensors.len());
    if sensors.is_empty() {
        bail!("No temperature sensors found under {}", dir.display());
    }
    Ok(sensors)
}

/// Probes `FAN_INDICES` under `dir`, in ascending order.
pub fn discover_fans(dir: &Path) -> Result<Vec<Fan>> {
    info!("Looking for fans under {}", dir.display());

    let fans: Vec<Fan> = FAN_INDICES
        .filter_map(|index| {
            debug!("Checking fan fan{index}");
            Fan::open(dir, index)
        })
        .inspect(|fan| info!("Found fan {}", fan.path().display()))
        .collect();

    info!("Found {} fans", fans.len());
    if fans.is_empty() {
        bail!("No fans found under {}", dir.display());
    }
    Ok(fans)
}

/// Owns every discovered sensor and fan handle.
///
/// Dropping the registry closes all handles; `close_all` does the same
/// explicitly and reports what was released.
#[derive(Debug)]
pub struct DeviceRegistry {
    sensors: Vec<Sensor>,
    fans: Vec<Fan>,
}

impl DeviceRegistry {
    /// Discovers sensors then fans. Either collection coming back empty is fatal.
    pub fn discover(paths: &DevicePaths) -> Result<Self> {
        let sensors = discover_sensors(&paths.sensor_dir)?;
        let fans = discover_fans(&paths.fan_dir)?;
        Ok(Self { sensors, fans })
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn fans(&self) -> &[Fan] {
        &self.fans
    }

    /// Switches every fan between manual and automatic control.
    ///
    /// A fan whose toggle cannot be written is skipped.
    pub fn set_mode(&self, manual: bool) {
        let mode = if manual { "manual" } else { "automatic" };
        info!("Setting fans to {mode} control");

        for fan in &self.fans {
            if let Err(e) = fan.set_manual(manual) {
                warn!(
                    "Failed to set {} to {mode}: {e}",
                    fan.manual_path().display()
                );
            }
        }
    }

    /// Refreshes all sensors and returns their aggregate in whole degrees.
    pub fn aggregate_temperature(&mut self) -> i64 {
        let readings: Vec<i64> = self
            .sensors
            .iter_mut()
            .map(Sensor::read_temperature)
            .collect();
        control::aggregate_temperature(&readings)
    }

    /// Writes `speed` to every fan. One failing fan does not stop the others.
    pub fn write_speed(&self, speed: i64) {
        for fan in &self.fans {
            if let Err(e) = fan.write_speed(speed) {
                warn!("Failed to write {speed} to {}: {e}", fan.path().display());
            }
        }
    }

    /// Closes every handle.
    pub fn close_all(self) {
        let (sensor_count, fan_count) = (self.sensors.len(), self.fans.len());
        drop(self.sensors);
        drop(self.fans);
        info!("Released {sensor_count} sensors and {fan_count} fans");
    }
}

/// Parses an optionally signed decimal integer at the start of `bytes`,
/// skipping leading whitespace.
fn parse_leading_int(bytes: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(bytes).ok()?.trim_start();
    let sign_len = usize::from(text.starts_with(['-', '+']));
    let digits = text[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    text[..sign_len + digits].parse().ok()
}
