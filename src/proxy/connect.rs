//! HTTP CONNECT handling for HTTPS tunnels.
//!
//! The flow is:
//!
//! 1. Client sends `CONNECT example.com:443 HTTP/1.1`
//! 2. The policy gate decides on `https://example.com:443`
//! 3. Blocked: reply `HTTP/1.1 403 Forbidden` and close
//! 4. Allowed: dial the destination, reply `HTTP/1.1 200 Connection Established`
//!    and splice both sockets
//!
//! The tunnel stays opaque. While it is open the same request is re-checked
//! every revalidation interval, and a block tears the tunnel down at once.
//!
//! A connection whose first request is CONNECT is handled on the raw socket
//! so the status lines above go out byte for byte. A CONNECT that arrives
//! later on a keep-alive connection goes through hyper's upgrade path.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::error::{ProxyError, ProxyResult};
use super::forward::{empty_body, status_response};
use super::policy::header_map;
use super::rewind::Rewind;
use super::server::{ConnectionContext, log_connection_error};
use crate::remote::{ValidationRequest, ValidationResult};
use crate::telemetry::AuditEvent;

/// Reply sent once the destination socket is open.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// Reply sent when the policy gate refuses the tunnel.
pub const CONNECT_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
/// Reply sent for an unparseable CONNECT target.
pub const CONNECT_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const CONNECT_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const CONNECT_GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";

/// Upper bound on a CONNECT request head.
const MAX_HEAD_BYTES: usize = 16 * 1024;

type Recheck<'a> = Pin<Box<dyn Future<Output = ValidationResult> + Send + 'a>>;

/// Request line and headers of a CONNECT request.
#[derive(Debug, PartialEq, Eq)]
struct ConnectHead {
    target: String,
    headers: BTreeMap<String, String>,
}

/// Handle a connection whose first request is CONNECT.
pub(crate) async fn handle_raw_connect(
    stream: Rewind<TcpStream>,
    ctx: Arc<ConnectionContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> ProxyResult<()> {
    let mut reader = BufReader::new(stream);

    let head = match read_connect_head(&mut reader).await {
        Ok(head) => head,
        Err(ProxyError::InvalidConnect(message)) => {
            debug!("Rejecting CONNECT: {}", message);
            let mut client = reader.into_inner();
            client.write_all(CONNECT_BAD_REQUEST).await?;
            let _ = client.shutdown().await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // Bytes the client pipelined after the head belong to the tunnel.
    let early_data = reader.buffer().to_vec();
    let mut client = reader.into_inner();

    let (host, port) = match parse_host_port(&head.target) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting CONNECT to '{}': {}", head.target, e);
            client.write_all(CONNECT_BAD_REQUEST).await?;
            let _ = client.shutdown().await;
            return Ok(());
        }
    };

    let request = ValidationRequest::new("CONNECT", format!("https://{}", head.target), head.headers);
    debug!("CONNECT request to {}:{}", host, port);

    if ctx.gate.check(&request).await.blocked {
        client.write_all(CONNECT_FORBIDDEN).await?;
        let _ = client.shutdown().await;
        return Ok(());
    }

    let mut upstream = match connect_upstream(&host, port, ctx.upstream_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let reply = match e {
                ProxyError::Timeout => CONNECT_GATEWAY_TIMEOUT,
                _ => CONNECT_BAD_GATEWAY,
            };
            client.write_all(reply).await?;
            let _ = client.shutdown().await;
            return Err(e);
        }
    };

    client.write_all(CONNECT_ESTABLISHED).await?;
    if !early_data.is_empty() {
        upstream.write_all(&early_data).await?;
    }

    run_tunnel(client, upstream, &head.target, request, &ctx, shutdown_rx).await
}

/// Handle a CONNECT that arrived on a connection already served by hyper.
pub(crate) async fn handle_upgrade_connect(
    req: Request<Incoming>,
    ctx: Arc<ConnectionContext>,
    shutdown_rx: watch::Receiver<bool>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST);
    };
    let Ok((host, port)) = parse_host_port(&target) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let request = ValidationRequest::new("CONNECT", format!("https://{}", target), header_map(req.headers()));
    if ctx.gate.check(&request).await.blocked {
        return status_response(StatusCode::FORBIDDEN);
    }

    let upstream = match connect_upstream(&host, port, ctx.upstream_timeout).await {
        Ok(upstream) => upstream,
        Err(ProxyError::Timeout) => return status_response(StatusCode::GATEWAY_TIMEOUT),
        Err(e) => {
            warn!("{}", e);
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                if let Err(e) = run_tunnel(client, upstream, &target, request, &ctx, shutdown_rx).await {
                    log_connection_error(&e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", target, e);
            }
        }
    });

    // hyper switches the connection to the upgrade once this is sent.
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
}

/// Open a TCP connection to the destination within `limit`.
pub(crate) async fn connect_upstream(host: &str, port: u16, limit: Duration) -> ProxyResult<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            debug!("Connected to upstream {}", addr);
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
            addr,
            message: e.to_string(),
        }),
        Err(_) => Err(ProxyError::Timeout),
    }
}

/// Splice `client` and `upstream` until either side closes, re-validating
/// `request` on every interval tick.
///
/// At most one re-check is in flight; a tick that finds one still running is
/// skipped. Returning drops both sockets, which also cancels any pending
/// re-check.
pub(crate) async fn run_tunnel<C>(
    client: C,
    upstream: TcpStream,
    target: &str,
    request: ValidationRequest,
    ctx: &ConnectionContext,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ProxyResult<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);
    tokio::pin!(client_to_upstream, upstream_to_client);

    let period = ctx.revalidate_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut recheck: Option<Recheck<'_>> = None;

    debug!("Tunnel open to {}", target);
    loop {
        tokio::select! {
            result = &mut client_to_upstream => {
                debug!("Client side of tunnel to {} closed", target);
                return result.map(|_| ()).map_err(ProxyError::from);
            }
            result = &mut upstream_to_client => {
                debug!("Upstream side of tunnel to {} closed", target);
                return result.map(|_| ()).map_err(ProxyError::from);
            }
            _ = ticker.tick() => {
                if recheck.is_some() {
                    debug!("Re-validation of {} still running, skipping tick", target);
                } else {
                    let again = request.restamped();
                    recheck = Some(Box::pin(async move { ctx.gate.check(&again).await }));
                }
            }
            decision = next_decision(&mut recheck) => {
                recheck = None;
                if decision.blocked {
                    info!("Closing tunnel to {} after re-validation blocked it", target);
                    ctx.audit.log(AuditEvent::TunnelRevoked {
                        target: target.to_string(),
                    });
                    return Ok(());
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("Closing tunnel to {} for shutdown", target);
                return Ok(());
            }
        }
    }
}

/// Resolve the in-flight re-check, or never when there is none.
async fn next_decision(recheck: &mut Option<Recheck<'_>>) -> ValidationResult {
    match recheck {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

async fn read_connect_head<R>(reader: &mut R) -> ProxyResult<ConnectHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut total = read_head_line(reader, &mut line, MAX_HEAD_BYTES).await?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(ProxyError::InvalidConnect("malformed request line".into()));
    };
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(ProxyError::InvalidConnect(format!("unexpected method {}", method)));
    }
    let target = target.to_string();

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    loop {
        line.clear();
        total += read_head_line(reader, &mut line, MAX_HEAD_BYTES - total).await?;

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            let value = value.trim().to_string();
            headers
                .entry(name.trim().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
    }

    Ok(ConnectHead { target, headers })
}

/// Read one head line of at most `budget` bytes into `line`.
///
/// Bytes past the budget stay unread, so a client that never sends a
/// newline cannot grow the buffer.
async fn read_head_line<R>(reader: &mut R, line: &mut String, budget: usize) -> ProxyResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader).take(budget as u64).read_line(line).await?;
    if line.ends_with('\n') {
        return Ok(n);
    }
    if n >= budget {
        Err(ProxyError::InvalidConnect("request head too large".into()))
    } else {
        Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()))
    }
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
pub fn parse_host_port(authority: &str) -> ProxyResult<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        _ if authority.starts_with('[') && authority.ends_with(']') => (authority, 443),
        // A bare IPv6 literal has colons but no port.
        Some((host, _)) if host.contains(':') && !host.starts_with('[') => (authority, 443),
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))?;
            (host, port)
        }
        None => (authority, 443),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() {
        return Err(ProxyError::InvalidConnect("missing host".into()));
    }
    Ok((host.to_string(), port))
}
