//! Functions and structures related to configuring a load test.
//!
//! httpload is configured at run time by passing in the options and flags
//! defined by the [`Configuration`] structure. The core of the load test
//! only ever sees a validated `Configuration`; parsing and defaults live
//! here.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::time::Duration;

use crate::logger::LogFormat;
use crate::util;
use crate::LoadTestError;

/// Default number of concurrent connections when `--connections` is not set.
const DEFAULT_CONNECTIONS: usize = 1;
/// Default test length in seconds when `--run-time` is not set.
const DEFAULT_RUN_TIME: usize = 60;

/// Runtime options available when launching a load test.
///
/// httpload leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the
/// help displayed with `-h` from the below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"httpload generates sustained HTTP load against a single target, over
persistent connections that are kept alive and not shared between workers.

The following runtime options are available when launching a load test:"#
)]
pub struct Configuration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Defines the target to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Sets the number of concurrent connections (default: 1)
    #[options(short = "c")]
    pub connections: Option<usize>,
    /// Sets per-second connection ramp-up rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub rampup_rate: Option<String>,
    /// Stops the load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets the target period between request starts, in seconds (ie 0.25)
    #[options(short = "d", meta = "SECONDS")]
    pub delay: Option<String>,
    /// Reconnects and carries on when the server closes a connection
    #[options(no_short)]
    pub reconnect: bool,

    /// Enables the log file and sets its name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases the log file verbosity (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases console verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases console verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
    /// Sets the request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets the request log format (json, raw)
    #[options(no_short, meta = "FORMAT")]
    pub request_format: Option<LogFormat>,
    /// Writes the final metrics to a json file
    #[options(no_short, meta = "NAME")]
    pub report_file: String,
}

impl Configuration {
    /// The number of concurrent connections, defaulting to 1.
    pub(crate) fn connections(&self) -> usize {
        self.connections.unwrap_or(DEFAULT_CONNECTIONS)
    }

    /// Connections admitted per elapsed second, defaulting to 1.
    pub(crate) fn rampup_rate(&self) -> f32 {
        util::get_rampup_rate(self.rampup_rate.clone())
    }

    /// How long the test runs, in seconds, defaulting to 60.
    pub(crate) fn run_time(&self) -> usize {
        if self.run_time.is_empty() {
            DEFAULT_RUN_TIME
        } else {
            util::parse_timespan(&self.run_time)
        }
    }

    /// The pacing delay between request starts, defaulting to none.
    pub(crate) fn delay(&self) -> Duration {
        match util::get_float_from_string(self.delay.clone()) {
            Some(seconds) if seconds > 0.0 => Duration::from_secs_f32(seconds),
            _ => Duration::from_secs(0),
        }
    }

    /// The request log format, defaulting to json.
    pub(crate) fn request_format(&self) -> LogFormat {
        self.request_format.clone().unwrap_or(LogFormat::Json)
    }

    /// Confirm all configured values are valid before a load test starts.
    pub(crate) fn validate(&self) -> Result<(), LoadTestError> {
        // A target is required, and it has to be a parseable http url.
        if self.host.is_empty() {
            return Err(LoadTestError::InvalidOption {
                option: "--host".to_string(),
                value: self.host.to_string(),
                detail: "A target must be defined via the --host option.".to_string(),
            });
        }
        util::is_valid_host(&self.host)?;

        if let Some(connections) = self.connections {
            if connections == 0 {
                return Err(LoadTestError::InvalidOption {
                    option: "--connections".to_string(),
                    value: connections.to_string(),
                    detail: "--connections must be set to at least 1.".to_string(),
                });
            }
        }

        if let Some(rampup_rate) = self.rampup_rate.clone() {
            match util::get_float_from_string(Some(rampup_rate.clone())) {
                Some(rate) if rate > 0.0 => (),
                _ => {
                    return Err(LoadTestError::InvalidOption {
                        option: "--rampup-rate".to_string(),
                        value: rampup_rate,
                        detail: "--rampup-rate must be a number greater than 0.".to_string(),
                    });
                }
            }
        }

        if !self.run_time.is_empty() && util::parse_timespan(&self.run_time) == 0 {
            return Err(LoadTestError::InvalidOption {
                option: "--run-time".to_string(),
                value: self.run_time.to_string(),
                detail: "--run-time must be a time span greater than 0, such as 30s or 5m."
                    .to_string(),
            });
        }

        if let Some(delay) = self.delay.clone() {
            match util::get_float_from_string(Some(delay.clone())) {
                Some(seconds) if seconds >= 0.0 => (),
                _ => {
                    return Err(LoadTestError::InvalidOption {
                        option: "--delay".to_string(),
                        value: delay,
                        detail: "--delay must be a number of seconds, 0 or greater.".to_string(),
                    });
                }
            }
        }

        if self.request_format.is_some() && self.request_log.is_empty() {
            return Err(LoadTestError::InvalidOption {
                option: "--request-format".to_string(),
                value: format!("{:?}", self.request_format),
                detail: "--request-format requires --request-log.".to_string(),
            });
        }

        Ok(())
    }

    /// Initialize the logger which writes to standard out and/or to a
    /// configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure console output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        // Otherwise disable the log.
        } else {
            None
        };

        if let Some(log_to_file) = log_file {
            match CombinedLogger::init(vec![
                SimpleLogger::new(debug_level, Config::default()),
                WriteLogger::new(
                    log_level,
                    Config::default(),
                    std::fs::File::create(&log_to_file).unwrap(),
                ),
            ]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
            info!("Writing to log file: {}", log_to_file.display());
        } else {
            match CombinedLogger::init(vec![SimpleLogger::new(debug_level, Config::default())]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Configuration {
        Configuration::parse_args_default(args)
            .expect("failed to parse options and generate a configuration")
    }

    #[test]
    fn defaults() {
        let configuration = parse(&["--host", "http://example.com/"]);
        assert_eq!(configuration.connections(), 1);
        assert!((configuration.rampup_rate() - 1.0).abs() < f32::EPSILON);
        assert_eq!(configuration.run_time(), 60);
        assert_eq!(configuration.delay(), Duration::from_secs(0));
        assert!(!configuration.reconnect);
        assert_eq!(configuration.request_format(), LogFormat::Json);
        assert!(configuration.validate().is_ok());
    }

    #[test]
    fn full_configuration() {
        let configuration = parse(&[
            "--host",
            "http://example.com/",
            "--connections",
            "25",
            "--rampup-rate",
            "2.5",
            "--run-time",
            "1h30m",
            "--delay",
            "0.25",
            "--reconnect",
        ]);
        assert_eq!(configuration.connections(), 25);
        assert!((configuration.rampup_rate() - 2.5).abs() < f32::EPSILON);
        assert_eq!(configuration.run_time(), 5400);
        assert_eq!(configuration.delay(), Duration::from_secs_f32(0.25));
        assert!(configuration.reconnect);
        assert!(configuration.validate().is_ok());
    }

    #[test]
    fn host_is_required() {
        let configuration = parse(&[]);
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn host_must_parse() {
        let configuration = parse(&["--host", "example.com"]);
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn connections_must_be_positive() {
        let configuration = parse(&["--host", "http://example.com/", "--connections", "0"]);
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn rampup_rate_must_be_positive() {
        let configuration = parse(&["--host", "http://example.com/", "--rampup-rate", "0"]);
        assert!(configuration.validate().is_err());
        let configuration = parse(&["--host", "http://example.com/", "--rampup-rate", "fast"]);
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn run_time_must_parse() {
        let configuration = parse(&["--host", "http://example.com/", "--run-time", "never"]);
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn delay_must_not_be_negative() {
        let mut configuration = parse(&["--host", "http://example.com/"]);
        configuration.delay = Some("-1".to_string());
        assert!(configuration.validate().is_err());
        // An invalid delay quietly defaulting to 0 would hide a typo.
        configuration.delay = Some("soon".to_string());
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn request_format_requires_request_log() {
        let configuration = parse(&["--host", "http://example.com/", "--request-format", "json"]);
        assert!(configuration.validate().is_err());
        let configuration = parse(&[
            "--host",
            "http://example.com/",
            "--request-log",
            "requests.log",
            "--request-format",
            "raw",
        ]);
        assert!(configuration.validate().is_ok());
    }
}
