//! Metrics collected and aggregated during a load test.
//!
//! Workers report one [`RequestMetric`] per request attempt over a channel.
//! The orchestrator folds each into [`TestMetrics`], which maintains all
//! counters incrementally: per-sample cost and memory stay constant no matter
//! how many requests a run generates. At shutdown [`TestMetrics::snapshot`]
//! produces the final [`MetricsSnapshot`], which renders the summary block
//! printed at the end of a load test.

use chrono::prelude::*;
use num_format::{Locale, ToFormattedString};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// How often an intermediate summary is emitted while requests are flowing.
const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

/// Incrementally tracks the count, total, mean and variance of a stream of
/// samples.
///
/// Uses Welford's online algorithm, so pushing a sample is O(1) and no sample
/// history is retained; request volume during a load test is effectively
/// unbounded.
#[derive(Debug, Clone, Default)]
pub struct Metric {
    count: u64,
    total: f64,
    mean: f64,
    m2: f64,
}

impl Metric {
    /// Fold one sample into the running statistics.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// How many samples have been pushed; never decreases.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all pushed samples.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Running mean of all pushed samples, 0 before the first sample.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Running population variance, 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    /// Running population standard deviation.
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// A set of independent [`Metric`]s keyed by an outcome category, such as a
/// status code or an error class. Categories are created lazily on first
/// occurrence.
#[derive(Debug, Clone, Default)]
pub struct CategoricalMetric {
    categories: BTreeMap<String, Metric>,
}

impl CategoricalMetric {
    /// Push `amount` into the metric for `key`, creating it if this is the
    /// first time the category is seen.
    pub fn push<K: Into<String>>(&mut self, key: K, amount: f64) {
        self.categories.entry(key.into()).or_default().push(amount);
    }

    /// The metric tracked for `key`, if the category has been seen.
    pub fn get(&self, key: &str) -> Option<&Metric> {
        self.categories.get(key)
    }

    /// All categories seen so far, sorted by label.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Metric)> {
        self.categories.iter()
    }

    /// How many distinct categories have been seen.
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    /// True if no category has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// The outcome of one request attempt, reported by the worker that made it.
///
/// Also the line format of the optional request log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    /// Index of the worker that issued the request.
    pub worker: usize,
    /// Milliseconds since the load test started.
    pub elapsed: u64,
    /// Time to receive the full response, in seconds, if a response arrived.
    pub latency: Option<f64>,
    /// HTTP status code, if a response arrived.
    pub status: Option<u16>,
    /// Error class label, if the attempt failed at the transport level.
    pub error: Option<String>,
    /// Whether the attempt counts as failed, either from a transport error or
    /// from a status code outside the 200-400 range.
    pub failed: bool,
    /// Response body bytes received.
    pub received: u64,
}

/// All metrics for a load test, merged together by the orchestrator.
#[derive(Debug, Clone)]
pub struct TestMetrics {
    /// When metrics collection started, for elapsed-time bookkeeping.
    started: Instant,
    /// Wall-clock start, stamped into the final snapshot.
    started_at: DateTime<Local>,
    /// How often [`update`](TestMetrics::update) emits a [`RunningSummary`].
    summary_interval: Duration,
    /// How many workers were admitted during ramp-up.
    pub workers: usize,
    /// Requests that received a response.
    pub completed: Metric,
    /// Requests that failed, from a transport error or a failure status.
    pub failed: Metric,
    /// Seconds from request start to full response receipt.
    pub latency: Metric,
    /// Response body bytes, one sample per completed request.
    pub received: Metric,
    /// Per-category counters keyed by status code or error class.
    pub response_codes: CategoricalMetric,
    // Bookkeeping for the periodic summary; reset each interval, unlike the
    // cumulative counters above.
    last_summary: Instant,
    completed_last: u64,
}

impl Default for TestMetrics {
    fn default() -> TestMetrics {
        TestMetrics::new(DEFAULT_SUMMARY_INTERVAL)
    }
}

impl TestMetrics {
    /// Create an empty set of metrics emitting intermediate summaries every
    /// `summary_interval`.
    pub fn new(summary_interval: Duration) -> TestMetrics {
        let now = Instant::now();
        TestMetrics {
            started: now,
            started_at: Local::now(),
            summary_interval,
            workers: 0,
            completed: Metric::default(),
            failed: Metric::default(),
            latency: Metric::default(),
            received: Metric::default(),
            response_codes: CategoricalMetric::default(),
            last_summary: now,
            completed_last: 0,
        }
    }

    /// Fold one request outcome into the metrics, routing each non-empty
    /// field to its counter.
    ///
    /// Returns an intermediate [`RunningSummary`] when more than the summary
    /// interval has passed since the last one, resetting the since-last
    /// bookkeeping but never the cumulative counters.
    pub fn update(&mut self, metric: RequestMetric) -> Option<RunningSummary> {
        if let Some(status) = metric.status {
            self.completed.push(1.0);
            self.received.push(metric.received as f64);
            self.response_codes.push(status.to_string(), 1.0);
        }
        if let Some(latency) = metric.latency {
            self.latency.push(latency);
        }
        if let Some(error) = metric.error {
            self.response_codes.push(error, 1.0);
        }
        if metric.failed {
            self.failed.push(1.0);
        }

        if self.last_summary.elapsed() > self.summary_interval {
            Some(self.running_summary())
        } else {
            None
        }
    }

    // Build the intermediate summary and reset the since-last bookkeeping.
    fn running_summary(&mut self) -> RunningSummary {
        let now = Instant::now();
        let since_last = now.duration_since(self.last_summary).as_secs_f64();
        let completed_since_last = self.completed.count() - self.completed_last;
        let rate = if since_last > 0.0 {
            completed_since_last as f64 / since_last
        } else {
            0.0
        };

        self.last_summary = now;
        self.completed_last = self.completed.count();

        RunningSummary {
            completed: self.completed.count(),
            failed: self.failed.count(),
            elapsed: self.started.elapsed(),
            rate,
        }
    }

    /// Produce the final snapshot for a run that lasted `duration`.
    ///
    /// All derived rates are defined even for an empty run: a test that never
    /// completed a request reports a failure rate and request rate of 0.
    pub fn snapshot(&self, duration: Duration) -> MetricsSnapshot {
        let completed = self.completed.count();
        let failed = self.failed.count();
        let failure_rate = if completed > 0 {
            failed as f64 / completed as f64
        } else {
            0.0
        };
        let duration_seconds = duration.as_secs_f64();
        let request_rate = if duration_seconds > 0.0 {
            completed as f64 / duration_seconds
        } else {
            0.0
        };

        MetricsSnapshot {
            started_at: self.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            duration: duration_seconds,
            workers: self.workers,
            completed,
            failed,
            failure_rate,
            request_rate,
            latency_mean: self.latency.mean(),
            latency_std_dev: self.latency.std_dev(),
            received: self.received.total() as u64,
            response_codes: self
                .response_codes
                .iter()
                .map(|(name, metric)| Category {
                    name: name.clone(),
                    count: metric.count(),
                })
                .collect(),
        }
    }
}

/// Intermediate counters emitted while the test runs, covering the interval
/// since the previous summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunningSummary {
    /// Requests completed since the start of the test.
    pub completed: u64,
    /// Requests failed since the start of the test.
    pub failed: u64,
    /// Time since the start of the test.
    pub elapsed: Duration,
    /// Requests per second since the previous summary.
    pub rate: f64,
}

impl fmt::Display for RunningSummary {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{} reqs completed in {}s at {:.1}/s, {} failed",
            self.completed.to_formatted_string(&Locale::en),
            self.elapsed.as_secs(),
            self.rate,
            self.failed.to_formatted_string(&Locale::en),
        )
    }
}

/// One observed outcome category and how often it occurred.
#[derive(Debug, Clone, Serialize)]
pub struct Category {
    /// Status code ("200") or error class ("server disconnected").
    pub name: String,
    /// How many requests ended in this category.
    pub count: u64,
}

/// The final statistics of a completed load test, produced once at shutdown.
///
/// Printing is left to the caller; the `Display` implementation renders the
/// standard final block, and the structure serializes to JSON for the
/// optional report file.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Wall-clock time the test started.
    pub started_at: String,
    /// Total test duration in seconds, from start to the stop signal.
    pub duration: f64,
    /// How many workers were admitted during ramp-up.
    pub workers: usize,
    /// Requests that received a response.
    pub completed: u64,
    /// Requests that failed.
    pub failed: u64,
    /// Ratio of failed to completed requests; 0 if none completed.
    pub failure_rate: f64,
    /// Average requests per second over the whole run; 0 for an empty run.
    pub request_rate: f64,
    /// Mean time to receive a full response, in seconds.
    pub latency_mean: f64,
    /// Standard deviation of the time to receive a full response, in seconds.
    pub latency_std_dev: f64,
    /// Total response body bytes received.
    pub received: u64,
    /// Every observed status code and error class with its count, sorted by
    /// label.
    pub response_codes: Vec<Category>,
}

impl MetricsSnapshot {
    /// How many requests ended in the named category, 0 if never observed.
    pub fn category_count(&self, name: &str) -> u64 {
        self.response_codes
            .iter()
            .find(|category| category.name == name)
            .map(|category| category.count)
            .unwrap_or(0)
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Started: {} (duration: {:.1} seconds)",
            self.started_at, self.duration
        )?;
        writeln!(fmt, " Workers: {}", self.workers)?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " completed         = {}",
            self.completed.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            fmt,
            " failed            = {} ({:.1}%)",
            self.failed.to_formatted_string(&Locale::en),
            self.failure_rate * 100.0
        )?;
        writeln!(fmt, " avg. request rate = {:.1} / second", self.request_rate)?;
        writeln!(
            fmt,
            " latency (mean)    = {:.1} ms",
            self.latency_mean * 1_000.0
        )?;
        writeln!(
            fmt,
            " latency (std)     = {:.1} ms",
            self.latency_std_dev * 1_000.0
        )?;
        writeln!(
            fmt,
            " received          = {} bytes",
            self.received.to_formatted_string(&Locale::en)
        )?;
        writeln!(fmt, " response codes / errors:")?;
        for category in &self.response_codes {
            writeln!(
                fmt,
                "    {} = {}",
                category.name,
                category.count.to_formatted_string(&Locale::en)
            )?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )
    }
}
