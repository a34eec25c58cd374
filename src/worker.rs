//! The per-worker request loop.
//!
//! Each worker runs in its own tokio task, issues one GET at a time over its
//! pinned connection lease, and reports every attempt to the orchestrator
//! over a channel. A worker that closes (fatal error, disconnect without
//! reconnect, or shutdown) never aborts the test; the orchestrator's active
//! set simply shrinks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::{self, Lease, Target};
use crate::metrics::RequestMetric;
use crate::StopSignal;

/// Statuses outside this range count as failed requests.
const SUCCESS_STATUS_RANGE: std::ops::RangeInclusive<u16> = 200..=400;

/// Messages workers send to the orchestrator.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// The outcome of one request attempt.
    Request(RequestMetric),
    /// The worker closed and will issue no further requests.
    Closed {
        /// Ramp-up index of the closed worker.
        worker: usize,
    },
}

/// Everything one worker owns: its lease, its pacing, and its channels back
/// to the orchestrator.
pub(crate) struct Worker {
    /// Ramp-up index, also the worker's key in the active set.
    pub number: usize,
    /// The connection pinned to this worker.
    pub lease: Lease,
    /// Parsed target every request is issued against.
    pub target: Arc<Target>,
    /// Target period between the start of consecutive requests.
    pub delay: Duration,
    /// Whether a server disconnect is survived by acquiring a new connection.
    pub reconnect: bool,
    /// Shared one-way stop flag, observed between cycles.
    pub stop_signal: Arc<StopSignal>,
    /// Channel reporting request outcomes and closure to the orchestrator.
    pub message_tx: flume::Sender<WorkerMessage>,
    /// Optional channel to the request logger.
    pub logger_tx: Option<flume::Sender<Option<RequestMetric>>>,
    /// When the load test started, for the elapsed stamp on each metric.
    pub started: Instant,
}

impl Worker {
    // Issue one GET over the pinned lease and read the full response body.
    async fn make_request(&mut self) -> Result<(u16, u64), client::RequestError> {
        let connection = self.lease.connect().await?;
        let request = self.target.get_request();
        let response = connection
            .send_request(request)
            .await
            .map_err(client::classify_send)?;
        let status = response.status().as_u16();
        // The whole body is read so received bytes can be accounted.
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(client::classify_response)?;
        Ok((status, body.len() as u64))
    }

    // Report one request outcome to the orchestrator, and to the request
    // logger when enabled. Both sends are best effort.
    fn report(&self, metric: RequestMetric) {
        if let Some(logger_tx) = self.logger_tx.as_ref() {
            let _ = logger_tx.send(Some(metric.clone()));
        }
        let _ = self.message_tx.send(WorkerMessage::Request(metric));
    }

    fn elapsed(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Run one worker until it closes.
///
/// Closure is terminal: the cleanup below the loop runs exactly once, and a
/// closed worker never issues another request.
pub(crate) async fn worker_main(mut worker: Worker) {
    info!("launching worker {}...", worker.number + 1);

    loop {
        // Cancellation is cooperative: the stop flag is checked between
        // cycles, and shutdown hard-cancels whatever is still in flight
        // after the grace period.
        if worker.stop_signal.is_stopped() {
            break;
        }

        let request_started = Instant::now();
        match worker.make_request().await {
            Ok((status, received)) => {
                let latency = request_started.elapsed();
                let failed = !SUCCESS_STATUS_RANGE.contains(&status);
                worker.report(RequestMetric {
                    worker: worker.number,
                    elapsed: worker.elapsed(),
                    latency: Some(latency.as_secs_f64()),
                    status: Some(status),
                    error: None,
                    failed,
                    received,
                });

                // The server may have completed the response and then closed
                // the connection; that is the disconnect condition too.
                if worker.lease.closed() {
                    if !worker.reconnect {
                        debug!(
                            "worker {}: server closed the connection, closing",
                            worker.number + 1
                        );
                        break;
                    }
                    debug!(
                        "worker {}: server closed the connection, reconnecting on next request",
                        worker.number + 1
                    );
                }

                // Pacing: the delay is a target period between request
                // starts, so only the remainder after a slow request is
                // slept off.
                if !worker.delay.is_zero() {
                    let pause = worker.delay.saturating_sub(latency);
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
            }
            Err(error) => {
                // A request torn down by shutdown is a cancellation, not a
                // failure.
                if worker.stop_signal.is_stopped() {
                    debug!("worker {}: cancelled mid-request", worker.number + 1);
                    break;
                }

                worker.report(RequestMetric {
                    worker: worker.number,
                    elapsed: worker.elapsed(),
                    latency: None,
                    status: None,
                    error: Some(error.class().to_string()),
                    failed: true,
                    received: 0,
                });

                if error.is_disconnect() && worker.reconnect {
                    debug!(
                        "worker {}: server disconnected, reconnecting...",
                        worker.number + 1
                    );
                    continue;
                }

                // Fatal for this worker only; the test carries on without it.
                debug!("worker {}: {}", worker.number + 1, error);
                break;
            }
        }
    }

    // Closed: release the connection for good and tell the orchestrator.
    worker.lease.close();
    let _ = worker.message_tx.send(WorkerMessage::Closed {
        worker: worker.number,
    });
    info!("exiting worker {}...", worker.number + 1);
}
