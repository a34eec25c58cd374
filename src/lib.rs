//! # httpload
//!
//! httpload is a load testing tool that generates sustained HTTP load
//! against a single target endpoint, over persistent connections that are
//! kept alive and _not_ shared between workers.
//!
//! Most load generators measure one-shot request bursts drawn from a common
//! connection pool. httpload instead models long-lived clients: every worker
//! acquires exactly one connection at launch, issues request after request
//! over it, and never returns it to a shared pool. The server under test
//! sees the traffic shape produced by real persistent clients.
//!
//! ## Running a load test
//!
//! ```bash
//! $ httpload --host http://dev.local/ -c 100 -r 10 -t 5m
//! ```
//!
//! The `-c` option sets how many concurrent connections to hold open, `-r`
//! how many connections to admit per second while ramping up, and `-t` how
//! long to run. Workers are admitted so that the observed admission ratio
//! never substantially exceeds the configured ramp-up rate; the first worker
//! is admitted immediately.
//!
//! Every request outcome is folded into streaming metrics. While the test
//! runs an intermediate summary is logged every 10 seconds:
//!
//! ```bash
//! 16:01:22 [ INFO] 12,345 reqs completed in 60s at 205.7/s, 17 failed
//! ```
//!
//! And when the test ends (run time expired, or `stop()` was triggered, for
//! example by ctrl-c) the final metrics print:
//!
//! ```bash
//!  ------------------------------------------------------------------------------
//!  Started: 2026-08-06 16:00:22 (duration: 300.0 seconds)
//!  Workers: 100
//!  ------------------------------------------------------------------------------
//!  completed         = 61,724
//!  failed            = 17 (0.0%)
//!  avg. request rate = 205.7 / second
//!  latency (mean)    = 32.1 ms
//!  latency (std)     = 4.5 ms
//!  received          = 81,231,204 bytes
//!  response codes / errors:
//!     200 = 61,707
//!     500 = 12
//!     server disconnected = 5
//!  ------------------------------------------------------------------------------
//! ```
//!
//! A worker that hits a fatal error (the connection refused, or the server
//! disconnecting when `--reconnect` is not set) closes permanently, and the
//! test carries on with one less worker. No single worker failure ever
//! aborts a run.
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

pub mod config;
pub mod logger;
pub mod metrics;
pub mod util;

mod client;
mod worker;

use gumdrop::Options;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{fmt, io, time};
use tokio::runtime::Runtime;

use crate::client::{ConnectionPool, Lease, Target};
use crate::metrics::{MetricsSnapshot, RequestMetric, TestMetrics};
use crate::worker::{Worker, WorkerMessage};

pub use crate::config::Configuration;

/// How long the admission loop sleeps while the ramp-up gate holds the next
/// worker back.
const ADMISSION_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// How often the wait loop polls for an expired run time or the stop flag.
const WAIT_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Grace allowed for in-flight requests to observe the stop flag before
/// connections are torn down and workers are cancelled.
const SHUTDOWN_GRACE_PERIOD: time::Duration = time::Duration::from_millis(100);

/// An enumeration of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum LoadTestError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
}

/// Implement a helper to provide a text description of all possible types of errors.
impl LoadTestError {
    fn describe(&self) -> &str {
        match *self {
            LoadTestError::Io(_) => "io::Error",
            LoadTestError::InvalidHost { .. } => "failed to parse hostname",
            LoadTestError::InvalidOption { .. } => "invalid option or value specified",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for LoadTestError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LoadTestError::Io(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "LoadTestError: {} ({})", self.describe(), parse_error),
            LoadTestError::InvalidOption { ref detail, .. } => {
                write!(f, "LoadTestError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for LoadTestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadTestError::Io(ref source) => Some(source),
            LoadTestError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for LoadTestError {
    fn from(err: io::Error) -> LoadTestError {
        LoadTestError::Io(err)
    }
}

/// The one-way stop flag for a load test, shared by the orchestrator, every
/// worker, and any external trigger such as an interrupt handler.
///
/// Once stopped, a signal never becomes unstopped, and the stop time is
/// recorded exactly once no matter how many callers race on [`stop`](StopSignal::stop).
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    stopped_at: Mutex<Option<time::Instant>>,
}

impl StopSignal {
    /// Signal the load test to stop. Idempotent, and safe to call from any
    /// thread, concurrently with the run loop.
    pub fn stop(&self) {
        // The lock serializes concurrent callers; the swap picks the single
        // one that records the stop time.
        let mut stopped_at = self.stopped_at.lock().unwrap();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            *stopped_at = Some(time::Instant::now());
        }
    }

    /// True once [`stop`](StopSignal::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// When the first [`stop`](StopSignal::stop) call happened.
    pub(crate) fn stopped_at(&self) -> Option<time::Instant> {
        *self.stopped_at.lock().unwrap()
    }
}

/// Internal run state for one load test.
struct LoadTestRunState {
    /// Sender handed to every worker for request outcomes and closure events.
    message_tx: flume::Sender<WorkerMessage>,
    /// Receiver used by the orchestrator to drain worker messages.
    message_rx: flume::Receiver<WorkerMessage>,
    /// The authoritative active-worker set, keyed by ramp-up index. Inserted
    /// on admission, removed when a worker's closure event is consumed.
    workers: HashMap<usize, tokio::task::JoinHandle<()>>,
    /// Optional sender to the request logger task, if enabled.
    logger_tx: Option<flume::Sender<Option<RequestMetric>>>,
    /// Optional join handle for the request logger task, if enabled.
    logger_handle: Option<tokio::task::JoinHandle<Result<(), LoadTestError>>>,
    /// Subtracts message-draining time from loop sleeps to avoid drift.
    drift_timer: tokio::time::Instant,
}

/// Global internal state for the load test.
pub struct LoadTest {
    /// Options set when launching the load test.
    configuration: Configuration,
    /// Shared one-way stop flag, also exposed to external triggers.
    stop_signal: Arc<StopSignal>,
    /// All metrics merged together.
    metrics: TestMetrics,
}

impl LoadTest {
    /// Load configuration from command-line options and initialize a
    /// [`LoadTest`].
    pub fn initialize() -> Result<LoadTest, LoadTestError> {
        LoadTest::initialize_with_config(Configuration::parse_args_default_or_exit())
    }

    /// Initialize a [`LoadTest`] with an already loaded configuration.
    ///
    /// This is generally used by tests, or to embed httpload.
    ///
    /// # Example
    /// ```rust
    /// use httpload::{Configuration, LoadTest};
    /// use gumdrop::Options;
    ///
    /// let configuration =
    ///     Configuration::parse_args_default(&["--host", "http://dev.local/"]).unwrap();
    /// let load_test = LoadTest::initialize_with_config(configuration).unwrap();
    /// ```
    pub fn initialize_with_config(configuration: Configuration) -> Result<LoadTest, LoadTestError> {
        Ok(LoadTest {
            configuration,
            stop_signal: Arc::new(StopSignal::default()),
            metrics: TestMetrics::default(),
        })
    }

    /// The shared stop signal, for wiring up external triggers such as an
    /// interrupt handler. The test stops cleanly when it is signalled.
    pub fn stop_handle(&self) -> Arc<StopSignal> {
        self.stop_signal.clone()
    }

    /// Signal the load test to stop. Idempotent.
    pub fn stop(&self) {
        self.stop_signal.stop();
    }

    /// Validate the configuration and perform the load test, blocking until
    /// it completes. Returns the final metrics snapshot.
    pub fn execute(self) -> Result<MetricsSnapshot, LoadTestError> {
        self.configuration.validate()?;
        self.configuration.initialize_logger();
        let rt = Runtime::new()?;
        rt.block_on(self.start())
    }

    /// Perform the load test on an already running tokio runtime. The
    /// configuration must have been validated first; [`execute`](LoadTest::execute)
    /// does both.
    pub async fn start(mut self) -> Result<MetricsSnapshot, LoadTestError> {
        // Fresh metrics, stamped with the run's start time.
        self.metrics = TestMetrics::default();
        let started = time::Instant::now();

        let connections = self.configuration.connections();
        let rampup_rate = self.configuration.rampup_rate();
        let run_time = self.configuration.run_time();
        let delay = self.configuration.delay();
        info!("connections = {}", connections);
        info!("rampup_rate = {}", rampup_rate);
        info!("run_time = {} seconds", run_time);

        let target = Arc::new(Target::new(&self.configuration.host)?);

        // The pool's keep-alive outlives the test so connections are only
        // ever ended by the server or by shutdown, and its capacity covers
        // one connection per configured worker.
        let keep_alive = time::Duration::from_secs(run_time.saturating_mul(2) as u64);
        let pool = Arc::new(ConnectionPool::new(
            target.address().to_string(),
            keep_alive,
            connections,
        ));

        // Create a single channel used to send metrics and closure events
        // from worker tasks to the orchestrator.
        let (message_tx, message_rx): (
            flume::Sender<WorkerMessage>,
            flume::Receiver<WorkerMessage>,
        ) = flume::unbounded();

        let mut run_state = LoadTestRunState {
            message_tx,
            message_rx,
            workers: HashMap::with_capacity(connections),
            logger_tx: None,
            logger_handle: None,
            drift_timer: tokio::time::Instant::now(),
        };

        // Optionally spawn the request logger task.
        if !self.configuration.request_log.is_empty() {
            let (logger_tx, logger_rx) = flume::unbounded();
            run_state.logger_handle =
                Some(tokio::spawn(self.configuration.clone().logger_main(logger_rx)));
            run_state.logger_tx = Some(logger_tx);
        }

        info!(
            "starting load test of {}, creating {} connections at {} connections/second",
            self.configuration.host, connections, rampup_rate
        );

        // Admit workers at the ramp-up rate. The gate is the observed ratio
        // of admitted workers to elapsed seconds: worker c waits while
        // c / elapsed exceeds the configured rate, which admits the first
        // worker immediately and self-corrects after any stall.
        for c in 0..connections {
            loop {
                if self.stop_signal.is_stopped() {
                    break;
                }
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 && c as f64 / elapsed > rampup_rate as f64 {
                    self.receive_worker_messages(&mut run_state);
                    run_state.drift_timer =
                        util::sleep_minus_drift(ADMISSION_INTERVAL, run_state.drift_timer).await;
                } else {
                    break;
                }
            }

            // Respond to the stop flag mid-ramp-up.
            if self.stop_signal.is_stopped() {
                info!("stopping mid ramp-up, admitted {} of {} workers", c, connections);
                break;
            }

            let worker = Worker {
                number: c,
                lease: Lease::new(pool.clone()),
                target: target.clone(),
                delay,
                reconnect: self.configuration.reconnect,
                stop_signal: self.stop_signal.clone(),
                message_tx: run_state.message_tx.clone(),
                logger_tx: run_state.logger_tx.clone(),
                started,
            };
            run_state
                .workers
                .insert(c, tokio::spawn(worker::worker_main(worker)));
            self.metrics.workers += 1;
        }
        info!(
            "launched {} workers in {:.1} seconds...",
            self.metrics.workers,
            started.elapsed().as_secs_f64()
        );

        // Wait until no more time remains in the test, or it was stopped.
        while !self.stop_signal.is_stopped() && !util::timer_expired(started, run_time) {
            self.receive_worker_messages(&mut run_state);
            run_state.drift_timer =
                util::sleep_minus_drift(WAIT_INTERVAL, run_state.drift_timer).await;
        }

        // Make sure the stop flag is set and the stop time recorded.
        self.stop();
        info!("stopping after {} seconds...", started.elapsed().as_secs());

        // Allow in-flight requests to observe the flag and finish cleanly.
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        self.receive_worker_messages(&mut run_state);

        // Forcibly terminate all pooled connections, then hard-cancel every
        // worker that has not already closed itself.
        pool.close();
        for (number, worker) in run_state.workers.drain() {
            debug!("cancelling worker {}", number + 1);
            worker.abort();
        }
        self.receive_worker_messages(&mut run_state);

        // Shut down the request logger, flushing it to disk.
        if let Some(logger_tx) = run_state.logger_tx.take() {
            let _ = logger_tx.send(None);
        }
        if let Some(logger_handle) = run_state.logger_handle.take() {
            match logger_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("request logger failed: {}", e),
                Err(e) => warn!("failed to join request logger: {}", e),
            }
        }

        // The test's duration runs from start to the first stop call, which
        // was at the latest the one above.
        let duration = match self.stop_signal.stopped_at() {
            Some(stopped_at) => stopped_at.duration_since(started),
            None => started.elapsed(),
        };
        info!("stopped after {:.1} seconds", duration.as_secs_f64());

        Ok(self.metrics.snapshot(duration))
    }

    // Drain all pending worker messages: fold request outcomes into the
    // metrics, logging the periodic summary when one is due, and remove
    // closed workers from the active set.
    fn receive_worker_messages(&mut self, run_state: &mut LoadTestRunState) {
        while let Ok(message) = run_state.message_rx.try_recv() {
            match message {
                WorkerMessage::Request(metric) => {
                    if let Some(summary) = self.metrics.update(metric) {
                        info!("{}", summary);
                    }
                }
                WorkerMessage::Closed { worker } => {
                    if run_state.workers.remove(&worker).is_some() {
                        debug!("worker {} closed", worker + 1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_is_idempotent() {
        let stop_signal = StopSignal::default();
        assert!(!stop_signal.is_stopped());
        assert!(stop_signal.stopped_at().is_none());

        stop_signal.stop();
        assert!(stop_signal.is_stopped());
        let stopped_at = stop_signal.stopped_at().unwrap();

        // Additional calls change nothing, including the recorded stop time.
        stop_signal.stop();
        stop_signal.stop();
        assert!(stop_signal.is_stopped());
        assert_eq!(stop_signal.stopped_at().unwrap(), stopped_at);
    }

    #[test]
    fn stop_signal_across_threads() {
        let stop_signal = Arc::new(StopSignal::default());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let stop_signal = stop_signal.clone();
            handles.push(std::thread::spawn(move || {
                stop_signal.stop();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(stop_signal.is_stopped());
        assert!(stop_signal.stopped_at().is_some());
    }
}
