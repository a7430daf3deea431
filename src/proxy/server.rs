//! Forwarding proxy server.
//!
//! This module provides the listener that system traffic is routed through
//! while a session is connected:
//! - Accepts TCP connections on a fixed local port
//! - Dispatches CONNECT tunnels and plain HTTP requests
//! - Checks each request with the policy gate
//! - Shuts down within a bounded grace period
//!
//! # Lifecycle
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Every connection
//! task observes the same shutdown signal, so stopping the proxy also ends
//! open tunnels and their re-validation timers.
//!
//! # Example
//!
//! ```ignore
//! use proctor_proxy::proxy::{ForwardingProxy, ProxyOptions};
//!
//! let proxy = ForwardingProxy::new(ProxyOptions::default(), config, validator, audit);
//! let port = proxy.start().await?;
//! // ...
//! proxy.stop().await;
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::connect::{handle_raw_connect, handle_upgrade_connect};
use super::error::{ProxyError, ProxyResult};
use super::forward::handle_http;
use super::policy::{PolicyGate, ProxyConfig, ProxyConfigUpdate, SharedProxyConfig};
use super::rewind::Rewind;
use super::tls::UpstreamTls;
use crate::remote::Validator;
use crate::telemetry::AuditLogger;

/// Default fixed local port.
pub const DEFAULT_PROXY_PORT: u16 = 8888;
/// Default time allowed for open connections to drain on stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
/// Default limit for reaching a destination.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
/// Default interval between re-validations of an open tunnel.
pub const DEFAULT_REVALIDATE_INTERVAL: Duration = Duration::from_secs(15);

/// Time allowed for a client to send enough bytes to tell CONNECT apart.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener and timing options for [`ForwardingProxy`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Interface to bind.
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Grace period for draining connections on stop.
    pub stop_grace: Duration,
    /// Limit for connecting to a destination and receiving its response head.
    pub upstream_timeout: Duration,
    /// Interval between tunnel re-validations.
    pub revalidate_interval: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PROXY_PORT,
            stop_grace: DEFAULT_STOP_GRACE,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            revalidate_interval: DEFAULT_REVALIDATE_INTERVAL,
        }
    }
}

/// Lifecycle state of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Draining connections.
    Stopping,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// Listening on the given port.
    Started(u16),
    /// Listener closed.
    Stopped,
    /// Listener-level failure.
    Error(String),
}

/// State shared by every connection task of one running proxy.
pub(crate) struct ConnectionContext {
    pub(crate) gate: PolicyGate,
    pub(crate) audit: Arc<AuditLogger>,
    pub(crate) tls: UpstreamTls,
    pub(crate) upstream_timeout: Duration,
    pub(crate) revalidate_interval: Duration,
}

struct RunningServer {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Local forwarding proxy.
pub struct ForwardingProxy {
    options: ProxyOptions,
    config: Arc<SharedProxyConfig>,
    validator: Arc<dyn Validator>,
    audit: Arc<AuditLogger>,
    events: broadcast::Sender<ProxyEvent>,
    status: watch::Sender<ProxyStatus>,
    /// Serializes start and stop.
    running: Mutex<Option<RunningServer>>,
}

impl ForwardingProxy {
    /// Create a stopped proxy.
    pub fn new(
        options: ProxyOptions,
        config: ProxyConfig,
        validator: Arc<dyn Validator>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let (status, _) = watch::channel(ProxyStatus::Stopped);

        Self {
            options,
            config: Arc::new(SharedProxyConfig::new(config)),
            validator,
            audit,
            events,
            status,
            running: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound port. Calling this while running returns the
    /// current port without rebinding.
    pub async fn start(&self) -> ProxyResult<u16> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(server.port);
        }

        self.status.send_replace(ProxyStatus::Starting);
        let addr = format!("{}:{}", self.options.host, self.options.port);

        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local.port())),
            Err(e) => Err(e),
        };
        let (listener, port) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.status.send_replace(ProxyStatus::Stopped);
                let err = ProxyError::Bind { addr, source };
                let _ = self.events.send(ProxyEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let ctx = Arc::new(ConnectionContext {
            gate: PolicyGate::new(self.config.clone(), self.validator.clone(), self.audit.clone()),
            audit: self.audit.clone(),
            tls: UpstreamTls::new(),
            upstream_timeout: self.options.upstream_timeout,
            revalidate_interval: self.options.revalidate_interval,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            shutdown_rx,
            self.options.stop_grace,
            self.events.clone(),
        ));

        *running = Some(RunningServer {
            port,
            shutdown_tx,
            accept_task,
        });
        self.status.send_replace(ProxyStatus::Running);
        info!("Proxy listening on {}:{}", self.options.host, port);
        let _ = self.events.send(ProxyEvent::Started(port));

        Ok(port)
    }

    /// Stop accepting connections and close open ones.
    ///
    /// Connections get the stop grace period to finish; whatever is still
    /// open afterwards is aborted. No-op when not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            return;
        };

        self.status.send_replace(ProxyStatus::Stopping);
        let _ = server.shutdown_tx.send(true);

        let mut accept_task = server.accept_task;
        if tokio::time::timeout(self.options.stop_grace, &mut accept_task)
            .await
            .is_err()
        {
            warn!("Proxy did not stop within {:?}, forcing close", self.options.stop_grace);
            accept_task.abort();
        }

        self.status.send_replace(ProxyStatus::Stopped);
        info!("Proxy stopped");
        let _ = self.events.send(ProxyEvent::Stopped);
    }

    /// Whether the proxy is accepting connections.
    pub fn is_active(&self) -> bool {
        *self.status.borrow() == ProxyStatus::Running
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ProxyStatus {
        *self.status.borrow()
    }

    /// Bound port while running, the configured port otherwise.
    pub fn get_port(&self) -> u16 {
        match self.running.try_lock() {
            Ok(running) => running
                .as_ref()
                .map_or(self.options.port, |server| server.port),
            // A start or stop is in progress; the configured port is the
            // answer for a fixed-port proxy.
            Err(_) => self.options.port,
        }
    }

    /// Merge a partial update into the live configuration.
    pub fn update_config(&self, update: ProxyConfigUpdate) {
        self.config.apply(&update);
        debug!("Proxy configuration updated");
    }

    /// Snapshot of the live configuration.
    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.snapshot()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown_rx: watch::Receiver<bool>,
    stop_grace: Duration,
    events: broadcast::Sender<ProxyEvent>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let ctx = ctx.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx, shutdown_rx).await {
                                log_connection_error(&e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        let _ = events.send(ProxyEvent::Error(e.to_string()));
                    }
                }
            }
            // Reap finished connections so the set does not grow unbounded.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("Proxy shutting down");
                break;
            }
        }
    }

    drop(listener);
    let drained = tokio::time::timeout(stop_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("Aborting {} connections still open after grace period", connections.len());
        connections.abort_all();
    }
}

/// Log a per-connection failure. Peer hang-ups are routine and stay at debug.
pub(crate) fn log_connection_error(e: &ProxyError) {
    if e.is_disconnect() {
        debug!("Connection ended: {}", e);
    } else {
        warn!("Connection error: {}", e);
    }
}

/// Handle a single client connection.
async fn handle_connection(
    mut stream: TcpStream,
    ctx: Arc<ConnectionContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> ProxyResult<()> {
    let (prefix, is_connect) = tokio::time::timeout(DISPATCH_TIMEOUT, read_dispatch_prefix(&mut stream))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    let stream = Rewind::new(prefix, stream);

    if is_connect {
        handle_raw_connect(stream, ctx, shutdown_rx).await
    } else {
        serve_http(stream, ctx, shutdown_rx).await
    }
}

/// Read just enough of the first request to see whether it is CONNECT.
///
/// Returns the bytes consumed so the chosen handler can replay them.
async fn read_dispatch_prefix<R>(stream: &mut R) -> std::io::Result<(Bytes, bool)>
where
    R: AsyncRead + Unpin,
{
    const PREFIX: &[u8] = b"CONNECT ";
    let mut buf = [0u8; PREFIX.len()];
    let mut filled = 0;

    while filled < PREFIX.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if !PREFIX.starts_with(&buf[..filled]) {
            break;
        }
    }

    let is_connect = &buf[..filled] == PREFIX;
    Ok((Bytes::copy_from_slice(&buf[..filled]), is_connect))
}

/// Serve HTTP/1.1 on the connection until the client or a shutdown ends it.
async fn serve_http<S>(
    stream: S,
    ctx: Arc<ConnectionContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service_shutdown = shutdown_rx.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let shutdown_rx = service_shutdown.clone();
        async move { Ok::<_, Infallible>(proxy_request(req, ctx, shutdown_rx).await) }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
    let connection = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => result.map_err(ProxyError::from),
        _ = shutdown_rx.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.await.map_err(ProxyError::from)
        }
    }
}

/// Process a single proxy request.
async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<ConnectionContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if req.method() == Method::CONNECT {
        handle_upgrade_connect(req, ctx, shutdown_rx).await
    } else {
        handle_http(req, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ValidationRequest, ValidationResult};
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;
    use url::Url;

    struct AllowAll;

    #[async_trait]
    impl Validator for AllowAll {
        async fn validate(&self, _config: &ProxyConfig, _request: &ValidationRequest) -> ValidationResult {
            ValidationResult::allowed()
        }
    }

    fn test_proxy(port: u16) -> ForwardingProxy {
        let options = ProxyOptions {
            port,
            ..ProxyOptions::default()
        };
        let config = ProxyConfig {
            event_key: "evt-1".to_string(),
            remote_host: String::new(),
            api_base_url: Url::parse("http://127.0.0.1:8000").unwrap(),
            is_monitoring: false,
        };
        ForwardingProxy::new(options, config, Arc::new(AllowAll), Arc::new(AuditLogger::new_null()))
    }

    #[test]
    fn test_default_options() {
        let options = ProxyOptions::default();
        assert_eq!(options.host, "127.0.0.1");
        assert_eq!(options.port, 8888);
        assert_eq!(options.revalidate_interval, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let proxy = test_proxy(0);
        let mut events = proxy.subscribe();

        let first = proxy.start().await.unwrap();
        let second = proxy.start().await.unwrap();

        assert_eq!(first, second);
        assert!(proxy.is_active());
        assert_eq!(proxy.get_port(), first);
        assert_eq!(events.recv().await.unwrap(), ProxyEvent::Started(first));
        assert!(events.try_recv().is_err());

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_to_stopped() {
        let proxy = test_proxy(0);
        let mut events = proxy.subscribe();
        let port = proxy.start().await.unwrap();

        proxy.stop().await;

        assert!(!proxy.is_active());
        assert_eq!(proxy.status(), ProxyStatus::Stopped);
        assert_eq!(events.recv().await.unwrap(), ProxyEvent::Started(port));
        assert_eq!(events.recv().await.unwrap(), ProxyEvent::Stopped);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let proxy = test_proxy(0);
        proxy.stop().await;
        assert_eq!(proxy.status(), ProxyStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let proxy = test_proxy(port);
        let mut events = proxy.subscribe();

        let err = proxy.start().await.unwrap_err();

        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(!proxy.is_active());
        assert!(matches!(events.recv().await.unwrap(), ProxyEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_update_config_merges() {
        let proxy = test_proxy(0);
        proxy.update_config(ProxyConfigUpdate::monitoring(true));

        let config = proxy.config();
        assert!(config.is_monitoring);
        assert_eq!(config.event_key, "evt-1");
    }

    #[tokio::test]
    async fn test_dispatch_prefix_waits_for_split_connect() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move { read_dispatch_prefix(&mut server).await });

        client.write_all(b"CON").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"NECT example.com:443").await.unwrap();

        let (prefix, is_connect) = reader.await.unwrap().unwrap();
        assert!(is_connect);
        assert_eq!(&prefix[..], b"CONNECT ");
    }

    #[tokio::test]
    async fn test_dispatch_prefix_stops_at_first_mismatch() {
        let mut input: &[u8] = b"GET http://example.com/ HTTP/1.1\r\n\r\n";

        let (prefix, is_connect) = read_dispatch_prefix(&mut input).await.unwrap();

        assert!(!is_connect);
        assert!(!prefix.is_empty());
        assert!(b"GET http".starts_with(&prefix));
    }

    #[tokio::test]
    async fn test_dispatch_prefix_on_early_eof() {
        let mut input: &[u8] = b"CONN";

        let (prefix, is_connect) = read_dispatch_prefix(&mut input).await.unwrap();

        assert!(!is_connect);
        assert_eq!(&prefix[..], b"CONN");
    }
}
