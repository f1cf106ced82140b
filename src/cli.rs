use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use crate::{
    devices::{APPLESMC_DIR, DevicePaths},
    pid_file::DEFAULT_PID_FILE,
};

/// mbpfand: fan speed daemon for Apple SMC hardware
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: searched in MBPFAND_CONFIG, ~/.config, /etc)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and log to syslog
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Lock record path
    #[arg(short = 'p', long = "pid-file", default_value = DEFAULT_PID_FILE)]
    pub pid_file: PathBuf,

    /// Directory holding tempN_input files
    #[arg(long = "sensor-dir", default_value = APPLESMC_DIR)]
    pub sensor_dir: PathBuf,

    /// Directory holding fanN_output and fanN_manual files
    #[arg(long = "fan-dir", default_value = APPLESMC_DIR)]
    pub fan_dir: PathBuf,

    /// Log every control tick
    #[arg(short = 'v', long = "verbose", default_value = "false")]
    pub verbose: bool,
}

impl Cli {
    pub fn device_paths(&self) -> DevicePaths {
        DevicePaths {
            sensor_dir: self.sensor_dir.clone(),
            fan_dir: self.fan_dir.clone(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_point_at_applesmc() {
        let cli = Cli::try_parse_from(["mbpfand"]).unwrap();

        assert_eq!(cli.device_paths(), DevicePaths::default());
        assert_eq!(cli.pid_file, PathBuf::from(DEFAULT_PID_FILE));
        assert!(!cli.daemonize);
        assert_eq!(cli.log_level(), LevelFilter::Info);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "mbpfand",
            "-c",
            "/tmp/fans.yml",
            "-d",
            "-p",
            "/run/mbpfand.pid",
            "--sensor-dir",
            "/tmp/sensors",
            "--fan-dir",
            "/tmp/fans",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fans.yml")));
        assert!(cli.daemonize);
        assert_eq!(cli.pid_file, PathBuf::from("/run/mbpfand.pid"));
        assert_eq!(cli.device_paths().sensor_dir, PathBuf::from("/tmp/sensors"));
        assert_eq!(cli.device_paths().fan_dir, PathBuf::from("/tmp/fans"));
        assert_eq!(cli.log_level(), LevelFilter::Debug);
    }
}
