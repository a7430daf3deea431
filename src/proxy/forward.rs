//! Plain HTTP forwarding.
//!
//! Proxy clients send absolute-form requests (`GET http://host/path`). A
//! permitted request is re-issued to its origin in origin-form with the
//! `Host` header rewritten, and the origin's status, headers and body are
//! streamed back unchanged. `https://` targets are re-originated over TLS.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::http::HeaderValue;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::connect::connect_upstream;
use super::error::{ProxyError, ProxyResult};
use super::policy::header_map;
use super::server::ConnectionContext;
use super::tls::domain_to_server_name;
use crate::remote::ValidationRequest;

/// Body of the page served for a blocked request.
pub const BLOCKED_PAGE: &str = "Site blocked during the evaluation";

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Handle plain HTTP proxy request (non-CONNECT).
///
/// Never fails: every outcome, including upstream errors, is rendered as a
/// response to the client.
pub(crate) async fn handle_http(req: Request<Incoming>, ctx: &ConnectionContext) -> Response<ProxyBody> {
    let target = req.uri().clone();
    if target.scheme().is_none() || target.host().is_none() {
        debug!("Rejecting non-absolute request target {}", target);
        return error_response(StatusCode::BAD_REQUEST, "request target must be an absolute URL");
    }

    let request = ValidationRequest::new(req.method().as_str(), target.to_string(), header_map(req.headers()));
    debug!("HTTP proxy request: {} {}", request.method, request.url);

    if ctx.gate.check(&request).await.blocked {
        return blocked_response();
    }

    match forward_request(req, &target, ctx).await {
        Ok(response) => response,
        Err(ProxyError::Timeout) => {
            warn!("Timed out forwarding to {}", target);
            error_response(StatusCode::GATEWAY_TIMEOUT, "timed out connecting to the website")
        }
        Err(e @ (ProxyError::UpstreamConnect { .. } | ProxyError::Tls(_))) => {
            warn!("Error forwarding to {}: {}", target, e);
            error_response(StatusCode::BAD_GATEWAY, "could not connect to the website")
        }
        Err(e) => {
            warn!("Error forwarding to {}: {}", target, e);
            error_response(StatusCode::BAD_GATEWAY, "local proxy error")
        }
    }
}

/// Re-issue `req` to the origin named by `target`.
///
/// Connecting, the TLS handshake and the wait for the response head are
/// each bounded by the upstream timeout. Uploading the request body is not.
async fn forward_request(
    req: Request<Incoming>,
    target: &Uri,
    ctx: &ConnectionContext,
) -> ProxyResult<Response<ProxyBody>> {
    let is_https = target.scheme_str() == Some("https");
    let host = target
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest("missing host".into()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = target.port_u16().unwrap_or(if is_https { 443 } else { 80 });

    let origin_form: Uri = target
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("{}", e)))?;
    let authority = target
        .authority()
        .map(|a| a.as_str())
        .unwrap_or(host);
    let host_header = HeaderValue::from_str(authority)
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    // Fires once the body has been handed to the origin, or dropped.
    let (sent_tx, sent_rx) = oneshot::channel::<()>();
    let (mut parts, body) = req.into_parts();
    parts.uri = origin_form;
    parts.headers.insert(HOST, host_header);
    let body = if body.is_end_stream() {
        drop(sent_tx);
        body.boxed()
    } else {
        body.with_trailers(async move {
            let _ = sent_tx.send(());
            None::<Result<HeaderMap, hyper::Error>>
        })
        .boxed()
    };
    let outgoing = Request::from_parts(parts, body);

    let limit = ctx.upstream_timeout;
    let stream = connect_upstream(host, port, limit).await?;

    if is_https {
        let connector = ctx.tls.connector().await?;
        let server_name = domain_to_server_name(host)?;
        let tls_stream = tokio::time::timeout(limit, connector.connect(server_name, stream))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;
        send_request(TokioIo::new(tls_stream), outgoing, sent_rx, limit).await
    } else {
        send_request(TokioIo::new(stream), outgoing, sent_rx, limit).await
    }
}

/// Send one request over a fresh HTTP/1.1 client connection.
///
/// The response head must arrive within `head_timeout` of `sent` firing.
async fn send_request<T>(
    io: T,
    req: Request<ProxyBody>,
    sent: oneshot::Receiver<()>,
    head_timeout: Duration,
) -> ProxyResult<Response<ProxyBody>>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    let response = sender.send_request(req);
    tokio::pin!(response);
    tokio::select! {
        result = &mut response => return Ok(result?.map(|body| body.boxed())),
        _ = sent => {}
    }

    let response = tokio::time::timeout(head_timeout, response)
        .await
        .map_err(|_| ProxyError::Timeout)??;
    Ok(response.map(|body| body.boxed()))
}

/// Create an empty response body.
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, text: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Bare response with only a status.
pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// 403 page for a request the authority refused.
pub(crate) fn blocked_response() -> Response<ProxyBody> {
    text_response(StatusCode::FORBIDDEN, BLOCKED_PAGE.to_string())
}

/// Generic error page.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    text_response(status, format!("Error: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocked_response() {
        let response = blocked_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], BLOCKED_PAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = error_response(StatusCode::GATEWAY_TIMEOUT, "timed out");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Error: timed out");
    }

    #[test]
    fn test_status_response() {
        assert_eq!(status_response(StatusCode::BAD_REQUEST).status(), StatusCode::BAD_REQUEST);
    }
}
