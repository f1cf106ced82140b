//! Log initialisation and daemonisation.

use std::fs::File;

use anyhow::{Result, anyhow};
use daemonize::Daemonize;
use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};
use tracing_subscriber::filter::LevelFilter as TraceLevel;

const PROCESS_NAME: &str = "mbpfand";
const DAEMON_OUTPUT: &str = "/var/tmp/mbpfand.log";

/// Installs the global logger: syslog when running as a daemon, a
/// `tracing_subscriber` formatter on stdout otherwise.
///
/// Records emitted through the `log` macros reach either backend.
pub fn init_log(daemon: bool, level: LevelFilter) -> Result<()> {
    if daemon {
        let logger = syslog::unix(Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: PROCESS_NAME.into(),
            pid: std::process::id(),
        })
        .map_err(|e| anyhow!("{e}"))?;

        log::set_boxed_logger(Box::new(BasicLogger::new(logger))).map_err(|e| anyhow!("{e}"))?;
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level(level))
            .with_target(true)
            .try_init()
            .map_err(|e| anyhow!("{e}"))?;
    }

    log::set_max_level(level);
    Ok(())
}

fn trace_level(level: LevelFilter) -> TraceLevel {
    match level {
        LevelFilter::Off => TraceLevel::OFF,
        LevelFilter::Error => TraceLevel::ERROR,
        LevelFilter::Warn => TraceLevel::WARN,
        LevelFilter::Info => TraceLevel::INFO,
        LevelFilter::Debug => TraceLevel::DEBUG,
        LevelFilter::Trace => TraceLevel::TRACE,
    }
}

/// Forks into the background, sending stray output to [`DAEMON_OUTPUT`].
pub fn into_daemon() -> Result<()> {
    File::create(DAEMON_OUTPUT)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn verbosity_maps_onto_subscriber_levels() {
        assert_eq!(trace_level(LevelFilter::Info), TraceLevel::INFO);
        assert_eq!(trace_level(LevelFilter::Debug), TraceLevel::DEBUG);
        assert_eq!(trace_level(LevelFilter::Off), TraceLevel::OFF);
    }

    #[test]
    fn foreground_logger_takes_requested_level() {
        init_log(false, LevelFilter::Debug).unwrap();

        assert_eq!(log::max_level(), LevelFilter::Debug);
        assert!(init_log(false, LevelFilter::Info).is_err());
    }
}
