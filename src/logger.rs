//! The optional request log.
//!
//! When enabled with the `--request-log` run-time option, a logger task is
//! spawned and every worker forwards a copy of each [`RequestMetric`] to it
//! over a channel, for efficient buffered logging to file. The log holds one
//! request per line, formatted per `--request-format`:
//!
//! - `json` (default): the metric serialized with serde_json, for example
//!   `{"worker":0,"elapsed":12,"latency":0.0021,"status":200,"error":null,"failed":false,"received":13}`
//! - `raw`: the metric's `Debug` representation.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;

use crate::config::Configuration;
use crate::metrics::RequestMetric;
use crate::LoadTestError;

/// Supported formats of the request log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Raw,
}

/// Allow `--request-format` to be set from the command line.
impl FromStr for LogFormat {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "raw" => Ok(LogFormat::Raw),
            _ => Err(LoadTestError::InvalidOption {
                option: "--request-format".to_string(),
                value: s.to_string(),
                detail: "Supported request formats: json, raw.".to_string(),
            }),
        }
    }
}

impl Configuration {
    /// Logger task, opens the request log and waits for messages from
    /// worker tasks. A `None` message shuts the logger down.
    pub(crate) async fn logger_main(
        self: Configuration,
        receiver: flume::Receiver<Option<RequestMetric>>,
    ) -> Result<(), LoadTestError> {
        // The orchestrator only spawns the logger when a log is configured.
        if self.request_log.is_empty() {
            return Ok(());
        }

        let file = File::create(&self.request_log).await?;
        info!("writing requests to request log: {}", self.request_log);
        let mut request_log = BufWriter::new(file);

        // Loop waiting for and writing request metrics from worker tasks.
        while let Ok(message) = receiver.recv_async().await {
            match message {
                Some(metric) => {
                    let formatted = match self.request_format() {
                        // Use serde_json to create JSON.
                        LogFormat::Json => json!(metric).to_string(),
                        // Raw format is Debug output of the RequestMetric structure.
                        LogFormat::Raw => format!("{:?}", metric),
                    };
                    match request_log.write(format!("{}\n", formatted).as_ref()).await {
                        Ok(_) => (),
                        Err(e) => {
                            warn!("failed to write to {}: {}", &self.request_log, e);
                        }
                    }
                }
                // Empty message means it's time to exit.
                None => break,
            }
        }

        // Cleanup and flush the log to disk.
        info!("flushing request log: {}", &self.request_log);
        let _ = request_log.flush().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_str() {
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("raw").unwrap(), LogFormat::Raw);
        assert!(LogFormat::from_str("csv").is_err());
    }

    #[tokio::test]
    async fn logs_one_request_per_line() {
        let log_file = std::env::temp_dir().join("httpload-request-log-test.log");
        let mut configuration = Configuration::default();
        configuration.request_log = log_file.to_str().unwrap().to_string();

        let (logger_tx, logger_rx) = flume::unbounded();
        let logger = tokio::spawn(configuration.logger_main(logger_rx));

        for worker in 0..3 {
            logger_tx
                .send(Some(RequestMetric {
                    worker,
                    elapsed: 10,
                    latency: Some(0.002),
                    status: Some(200),
                    error: None,
                    failed: false,
                    received: 13,
                }))
                .unwrap();
        }
        logger_tx.send(None).unwrap();
        logger.await.unwrap().unwrap();

        let written = std::fs::read_to_string(&log_file).unwrap();
        assert_eq!(written.lines().count(), 3);
        // Every line is valid json carrying the logged fields.
        for line in written.lines() {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["status"], 200);
            assert_eq!(parsed["received"], 13);
        }
        let _ = std::fs::remove_file(&log_file);
    }
}
