//! Connections, and the lease that pins one of them to one worker.
//!
//! The defining property of an httpload test is that every worker keeps a
//! single physical connection alive across many requests, and that connection
//! is never shared with or recycled by another worker. The
//! [`ConnectionPool`] is only an acquisition point: it opens connections,
//! bounds how many can be live, and can forcibly terminate all of them at
//! shutdown. Once a [`Lease`] acquires a connection it owns it outright:
//! there is no path that returns a connection to the pool, only a true close
//! when the lease discards it.

use hyper::client::conn::{self, SendRequest};
use hyper::{Body, Request, Response, Uri};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::{AbortHandle, JoinHandle};
use url::Url;

use crate::LoadTestError;

/// An error from one request attempt, classified for the reconnect policy and
/// the categorical metrics.
///
/// Every variant is fatal for the worker that hit it, with one exception:
/// `Disconnected` is recovered from when reconnect-on-disconnect is enabled.
#[derive(Debug)]
pub enum RequestError {
    /// The TCP connection to the target could not be established.
    Connect(io::Error),
    /// The HTTP handshake on a freshly opened connection failed.
    Handshake(hyper::Error),
    /// The request could not be sent.
    Send(hyper::Error),
    /// The response or its body could not be read.
    Response(hyper::Error),
    /// The server closed the connection mid-exchange.
    Disconnected,
    /// The shared pool already has its full capacity of live connections.
    Exhausted,
    /// The shared pool was closed by shutdown.
    Closed,
}

impl RequestError {
    /// Category label recorded in the response codes / errors breakdown.
    pub fn class(&self) -> &'static str {
        match *self {
            RequestError::Connect(_)
            | RequestError::Handshake(_)
            | RequestError::Exhausted
            | RequestError::Closed => "connect error",
            RequestError::Send(_) => "send error",
            RequestError::Response(_) => "response error",
            RequestError::Disconnected => "server disconnected",
        }
    }

    /// True when the server went away; the only transient error class.
    pub fn is_disconnect(&self) -> bool {
        matches!(*self, RequestError::Disconnected)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RequestError::Connect(ref source) => write!(f, "{}: {}", self.class(), source),
            RequestError::Handshake(ref source) => write!(f, "{}: {}", self.class(), source),
            RequestError::Send(ref source) => write!(f, "{}: {}", self.class(), source),
            RequestError::Response(ref source) => write!(f, "{}: {}", self.class(), source),
            RequestError::Disconnected => write!(f, "server disconnected"),
            RequestError::Exhausted => write!(f, "connection pool exhausted"),
            RequestError::Closed => write!(f, "connection pool closed"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            RequestError::Connect(ref source) => Some(source),
            RequestError::Handshake(ref source) => Some(source),
            RequestError::Send(ref source) => Some(source),
            RequestError::Response(ref source) => Some(source),
            _ => None,
        }
    }
}

// hyper reports a peer that went away in several shapes: its own closed
// channel and incomplete message errors, or a reset/broken-pipe io error
// somewhere in the source chain.
fn is_disconnect_error(error: &hyper::Error) -> bool {
    if error.is_closed() || error.is_incomplete_message() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_error.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

/// Classify a failure to dispatch a request.
pub(crate) fn classify_send(error: hyper::Error) -> RequestError {
    if is_disconnect_error(&error) {
        RequestError::Disconnected
    } else {
        RequestError::Send(error)
    }
}

/// Classify a failure to receive a response or read its body.
pub(crate) fn classify_response(error: hyper::Error) -> RequestError {
    if is_disconnect_error(&error) {
        RequestError::Disconnected
    } else {
        RequestError::Response(error)
    }
}

/// The parsed form of the configured target URL, validated once at startup.
#[derive(Debug)]
pub(crate) struct Target {
    /// `host:port` the pool connects to.
    address: String,
    /// Value of the `Host` header sent with every request.
    host_header: String,
    /// Origin-form request path, including the query string.
    path_and_query: Uri,
}

impl Target {
    pub(crate) fn new(host: &str) -> Result<Target, LoadTestError> {
        let url = Url::parse(host).map_err(|parse_error| LoadTestError::InvalidHost {
            host: host.to_string(),
            detail: "Invalid host.".to_string(),
            parse_error,
        })?;

        // The lease hands out raw TCP connections, so only plain http targets
        // are supported.
        if url.scheme() != "http" {
            return Err(LoadTestError::InvalidOption {
                option: "--host".to_string(),
                value: host.to_string(),
                detail: "Only http:// targets are supported.".to_string(),
            });
        }

        let host_name = match url.host_str() {
            Some(host_name) => host_name.to_string(),
            None => {
                return Err(LoadTestError::InvalidOption {
                    option: "--host".to_string(),
                    value: host.to_string(),
                    detail: "A host name is required.".to_string(),
                });
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let mut path_and_query = url.path().to_string();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let path_and_query: Uri =
            path_and_query
                .parse()
                .map_err(|_| LoadTestError::InvalidOption {
                    option: "--host".to_string(),
                    value: host.to_string(),
                    detail: "The path could not be parsed.".to_string(),
                })?;

        Ok(Target {
            address: format!("{}:{}", host_name, port),
            host_header: if port == 80 {
                host_name
            } else {
                format!("{}:{}", host_name, port)
            },
            path_and_query,
        })
    }

    /// `host:port` the pool connects to.
    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Build the GET request issued by every worker cycle.
    pub(crate) fn get_request(&self) -> Request<Body> {
        Request::get(self.path_and_query.clone())
            .header(hyper::header::HOST, self.host_header.as_str())
            .body(Body::empty())
            .expect("request parts were validated at startup")
    }
}

/// The shared acquisition point all leases draw from, built once per run.
///
/// The pool never takes a connection back; `release` and `close` are true
/// closes. The keep-alive expiry is sized to twice the test duration by the
/// orchestrator so connections outlive the run unless the server ends them.
pub(crate) struct ConnectionPool {
    address: String,
    keep_alive: Duration,
    capacity: usize,
    live: AtomicUsize,
    closed: AtomicBool,
    /// Abort handles for every connection driver spawned, so shutdown can
    /// forcibly terminate all connections.
    drivers: Mutex<Vec<AbortHandle>>,
}

impl ConnectionPool {
    pub(crate) fn new(address: String, keep_alive: Duration, capacity: usize) -> ConnectionPool {
        ConnectionPool {
            address,
            keep_alive,
            capacity,
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drivers: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Open one new connection and hand over ownership.
    pub(crate) async fn acquire(&self) -> Result<PooledConnection, RequestError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RequestError::Closed);
        }
        // Reserve a slot before connecting so concurrent acquisitions can not
        // overshoot the capacity.
        if self.live.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(RequestError::Exhausted);
        }
        match open_connection(&self.address, self.keep_alive).await {
            Ok(connection) => {
                self.drivers
                    .lock()
                    .unwrap()
                    .push(connection.abort_handle());
                Ok(connection)
            }
            Err(error) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    /// Terminate a connection a lease is discarding. A true close, not a
    /// return: the connection is gone and its capacity slot is free again.
    pub(crate) fn release(&self, connection: PooledConnection) {
        connection.terminate();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close the pool: no further acquisitions, and every connection ever
    /// handed out is forcibly terminated.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut drivers = self.drivers.lock().unwrap();
        debug!("closing connection pool to {}", self.address);
        for driver in drivers.drain(..) {
            driver.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// One HTTP/1.1 connection: the request handle plus the driver task that
/// polls the underlying socket until the connection dies.
pub(crate) struct PooledConnection {
    send_request: SendRequest<Body>,
    driver: JoinHandle<()>,
    expires_at: Option<Instant>,
}

impl PooledConnection {
    /// True once the underlying connection can take no more requests.
    pub(crate) fn closed(&self) -> bool {
        self.driver.is_finished()
            || self.expires_at.map_or(false, |at| Instant::now() >= at)
    }

    /// Dispatch one request and await the response head.
    pub(crate) async fn send_request(
        &mut self,
        request: Request<Body>,
    ) -> Result<Response<Body>, hyper::Error> {
        self.send_request.send_request(request).await
    }

    fn abort_handle(&self) -> AbortHandle {
        self.driver.abort_handle()
    }

    fn terminate(&self) {
        self.driver.abort();
    }
}

// Open a TCP connection, perform the HTTP/1.1 handshake, and spawn the task
// that drives the connection until it closes.
async fn open_connection(
    address: &str,
    keep_alive: Duration,
) -> Result<PooledConnection, RequestError> {
    debug!("opening connection to {}", address);
    let stream = TcpStream::connect(address)
        .await
        .map_err(RequestError::Connect)?;
    let (send_request, connection) = conn::handshake(stream)
        .await
        .map_err(RequestError::Handshake)?;
    let driver = tokio::spawn(async move {
        if let Err(error) = connection.await {
            debug!("connection closed with error: {}", error);
        }
    });
    Ok(PooledConnection {
        send_request,
        driver,
        expires_at: Instant::now().checked_add(keep_alive),
    })
}

/// An exclusive, non-returnable hold on one pooled connection, owned by one
/// worker for its lifetime.
pub(crate) struct Lease {
    pool: Arc<ConnectionPool>,
    connection: Option<PooledConnection>,
}

impl Lease {
    pub(crate) fn new(pool: Arc<ConnectionPool>) -> Lease {
        Lease {
            pool,
            connection: None,
        }
    }

    /// The pinned connection, acquiring a fresh one from the pool first if
    /// none is held or the held one reports closed. Completing an exchange
    /// never releases the connection; it stays pinned for the next request.
    pub(crate) async fn connect(&mut self) -> Result<&mut PooledConnection, RequestError> {
        if self.connection.as_ref().map_or(true, |c| c.closed()) {
            if let Some(old) = self.connection.take() {
                debug!("discarding closed connection");
                self.pool.release(old);
            }
            let connection = self.pool.acquire().await?;
            self.connection = Some(connection);
        }
        // Either the held connection was still live, or one was just acquired.
        Ok(self.connection.as_mut().expect("lease holds a connection"))
    }

    /// Explicitly terminate the held connection and mark the lease empty.
    pub(crate) fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }

    /// True only if a connection is held and it reports itself closed.
    pub(crate) fn closed(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| c.closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_defaults() {
        let target = Target::new("http://example.com").unwrap();
        assert_eq!(target.address(), "example.com:80");
        assert_eq!(target.host_header, "example.com");
        assert_eq!(target.path_and_query, "/");
    }

    #[test]
    fn target_port_path_and_query() {
        let target = Target::new("http://10.21.32.33:8080/status?verbose=1").unwrap();
        assert_eq!(target.address(), "10.21.32.33:8080");
        assert_eq!(target.host_header, "10.21.32.33:8080");
        assert_eq!(target.path_and_query, "/status?verbose=1");
    }

    #[test]
    fn target_rejects_https() {
        assert!(Target::new("https://example.com").is_err());
    }

    #[test]
    fn target_rejects_unparseable() {
        assert!(Target::new("example.com").is_err());
        assert!(Target::new("http://").is_err());
    }

    #[test]
    fn request_error_classes() {
        assert_eq!(RequestError::Disconnected.class(), "server disconnected");
        assert_eq!(RequestError::Exhausted.class(), "connect error");
        assert_eq!(
            RequestError::Connect(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
                .class(),
            "connect error"
        );
        assert!(RequestError::Disconnected.is_disconnect());
        assert!(!RequestError::Exhausted.is_disconnect());
    }

    // Accept connections and hold them open so acquired connections stay
    // live for the duration of a test.
    async fn server_holding_connections() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });
        address
    }

    #[tokio::test]
    async fn pool_enforces_capacity() {
        let address = server_holding_connections().await;
        let pool = ConnectionPool::new(address, Duration::from_secs(60), 1);

        let connection = pool.acquire().await.unwrap();
        assert_eq!(pool.live(), 1);

        // The single capacity slot is taken.
        match pool.acquire().await {
            Err(RequestError::Exhausted) => (),
            _ => panic!("expected the pool to be exhausted"),
        }

        // Releasing frees the slot for a fresh connection.
        pool.release(connection);
        assert_eq!(pool.live(), 0);
        let _connection = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn closed_pool_refuses_acquisitions() {
        let address = server_holding_connections().await;
        let pool = ConnectionPool::new(address, Duration::from_secs(60), 2);
        pool.close();
        match pool.acquire().await {
            Err(RequestError::Closed) => (),
            _ => panic!("expected the pool to be closed"),
        }
    }

    #[tokio::test]
    async fn lease_pins_and_closes() {
        let address = server_holding_connections().await;
        let pool = Arc::new(ConnectionPool::new(address, Duration::from_secs(60), 1));
        let mut lease = Lease::new(pool.clone());

        // Nothing held yet.
        assert!(!lease.closed());

        lease.connect().await.unwrap();
        assert_eq!(pool.live(), 1);
        assert!(!lease.closed());

        // A second connect reuses the pinned connection rather than drawing
        // from the pool again.
        lease.connect().await.unwrap();
        assert_eq!(pool.live(), 1);

        lease.close();
        assert_eq!(pool.live(), 0);
        assert!(!lease.closed());
    }
}
