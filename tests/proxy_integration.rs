//! End-to-end tests of the forwarding proxy over real sockets.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proctor_proxy::proxy::{
    BLOCKED_PAGE, CONNECT_BAD_REQUEST, CONNECT_ESTABLISHED, CONNECT_FORBIDDEN, ForwardingProxy,
    ProxyConfig, ProxyConfigUpdate, ProxyOptions,
};
use proctor_proxy::remote::{ValidationRequest, ValidationResult, Validator};
use proctor_proxy::telemetry::AuditLogger;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use url::Url;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Validator whose verdict and latency can be changed mid-test.
#[derive(Default)]
struct SwitchValidator {
    block: AtomicBool,
    calls: AtomicUsize,
    last_url: Mutex<Option<String>>,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SwitchValidator {
    fn blocking() -> Arc<Self> {
        let validator = Self::default();
        validator.block.store(true, Ordering::SeqCst);
        Arc::new(validator)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for SwitchValidator {
    async fn validate(&self, _config: &ProxyConfig, request: &ValidationRequest) -> ValidationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap() = Some(request.url.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.block.load(Ordering::SeqCst) {
            ValidationResult::blocked("Site not allowed")
        } else {
            ValidationResult::allowed()
        }
    }
}

async fn start_proxy(
    validator: Arc<SwitchValidator>,
    monitoring: bool,
    revalidate_interval: Duration,
) -> (ForwardingProxy, u16) {
    let options = ProxyOptions {
        port: 0,
        revalidate_interval,
        ..ProxyOptions::default()
    };
    start_proxy_with(validator, monitoring, options).await
}

async fn start_proxy_with(
    validator: Arc<SwitchValidator>,
    monitoring: bool,
    options: ProxyOptions,
) -> (ForwardingProxy, u16) {
    let proxy = ForwardingProxy::new(
        options,
        ProxyConfig {
            event_key: "EVT-1".to_string(),
            remote_host: String::new(),
            api_base_url: Url::parse("http://127.0.0.1:8000").unwrap(),
            is_monitoring: monitoring,
        },
        validator,
        Arc::new(AuditLogger::new_null()),
    );
    let port = proxy.start().await.unwrap();
    (proxy, port)
}

/// TCP server that echoes everything back.
async fn echo_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    port
}

/// HTTP server answering "hello" and recording request heads.
async fn http_origin() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let heads = Arc::new(Mutex::new(Vec::new()));
    let seen = heads.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                seen.lock().unwrap().push(String::from_utf8_lossy(&buf).into_owned());
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
                    )
                    .await;
            });
        }
    });
    (port, heads)
}

/// HTTP server that reads the full request body before answering "done".
async fn upload_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                        let length: usize = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .map_or(0, |v| v.trim().parse().unwrap());
                        if buf.len() >= end + 4 + length {
                            break;
                        }
                    }
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndone")
                    .await;
            });
        }
    });
    port
}

/// Server that accepts connections and never answers.
async fn silent_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn http_get(proxy_port: u16, url: &str) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    client
        .write_all(format!("GET {url} HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    String::from_utf8(read_all(&mut client).await).unwrap()
}

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut out))
        .await
        .expect("read timed out")
        .unwrap();
    out
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut out))
        .await
        .expect("read timed out")
        .unwrap();
    out
}

async fn open_tunnel(proxy_port: u16, target: &str) -> TcpStream {
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    client
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn test_blocked_connect_gets_exact_forbidden() {
    let validator = SwitchValidator::blocking();
    let (proxy, port) = start_proxy(validator.clone(), true, Duration::from_secs(15)).await;

    let mut client = open_tunnel(port, "example.com:443").await;

    assert_eq!(read_all(&mut client).await, CONNECT_FORBIDDEN);
    assert_eq!(validator.calls(), 1);
    assert_eq!(
        validator.last_url.lock().unwrap().as_deref(),
        Some("https://example.com:443")
    );
    proxy.stop().await;
}

#[tokio::test]
async fn test_allowed_connect_splices_bytes() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator.clone(), true, Duration::from_secs(15)).await;
    let origin = echo_origin().await;

    let mut client = open_tunnel(port, &format!("127.0.0.1:{origin}")).await;
    assert_eq!(
        read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await,
        CONNECT_ESTABLISHED
    );

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 4).await, b"ping");
    assert_eq!(validator.calls(), 1);
    proxy.stop().await;
}

#[tokio::test]
async fn test_unmonitored_connect_skips_validation() {
    let validator = SwitchValidator::blocking();
    let (proxy, port) = start_proxy(validator.clone(), false, Duration::from_secs(15)).await;
    let origin = echo_origin().await;

    let mut client = open_tunnel(port, &format!("127.0.0.1:{origin}")).await;

    assert_eq!(
        read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await,
        CONNECT_ESTABLISHED
    );
    assert_eq!(validator.calls(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn test_revalidation_revokes_open_tunnel() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator.clone(), true, Duration::from_millis(100)).await;
    let origin = echo_origin().await;

    let mut client = open_tunnel(port, &format!("127.0.0.1:{origin}")).await;
    read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await;
    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 4).await, b"ping");

    validator.block.store(true, Ordering::SeqCst);

    // The next re-check closes the tunnel; nothing more comes through.
    let rest = read_all(&mut client).await;
    assert!(rest.is_empty());
    assert!(validator.calls() >= 2);
    proxy.stop().await;
}

#[tokio::test]
async fn test_monitoring_switch_applies_to_next_connect() {
    let validator = SwitchValidator::blocking();
    let (proxy, port) = start_proxy(validator.clone(), false, Duration::from_secs(15)).await;

    proxy.update_config(ProxyConfigUpdate::monitoring(true));
    let mut client = open_tunnel(port, "example.com:443").await;

    assert_eq!(read_all(&mut client).await, CONNECT_FORBIDDEN);
    assert!(proxy.config().is_monitoring);
    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_without_host_is_bad_request() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator.clone(), true, Duration::from_secs(15)).await;

    let mut client = open_tunnel(port, ":443").await;

    assert_eq!(read_all(&mut client).await, CONNECT_BAD_REQUEST);
    assert_eq!(validator.calls(), 0);
    proxy.stop().await;
}

#[tokio::test]
async fn test_unreachable_tunnel_target_is_bad_gateway() {
    let closed = closed_port().await;
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator, true, Duration::from_secs(15)).await;

    let mut client = open_tunnel(port, &format!("127.0.0.1:{closed}")).await;

    assert_eq!(read_all(&mut client).await, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_is_forwarded_in_origin_form() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator.clone(), true, Duration::from_secs(15)).await;
    let (origin, heads) = http_origin().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin}/exam?q=1 HTTP/1.1\r\nHost: wrong.example\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let response = String::from_utf8(read_all(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hello"));

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("GET /exam?q=1 HTTP/1.1\r\n"));
    assert!(heads[0].to_ascii_lowercase().contains(&format!("host: 127.0.0.1:{origin}")));
    assert_eq!(
        validator.last_url.lock().unwrap().as_deref(),
        Some(format!("http://127.0.0.1:{origin}/exam?q=1").as_str())
    );
    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_blocked_page() {
    let validator = SwitchValidator::blocking();
    let (proxy, port) = start_proxy(validator, true, Duration::from_secs(15)).await;
    let (origin, heads) = http_origin().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(
            format!("GET http://127.0.0.1:{origin}/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let response = String::from_utf8(read_all(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 403"));
    assert!(response.contains(BLOCKED_PAGE));
    assert!(heads.lock().unwrap().is_empty());
    proxy.stop().await;
}

#[tokio::test]
async fn test_stop_closes_open_tunnels() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator, true, Duration::from_secs(15)).await;
    let origin = echo_origin().await;

    let mut client = open_tunnel(port, &format!("127.0.0.1:{origin}")).await;
    read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await;

    proxy.stop().await;

    assert!(read_all(&mut client).await.is_empty());
    assert!(!proxy.is_active());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_early_data_reaches_destination() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator, true, Duration::from_secs(15)).await;
    let origin = echo_origin().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{origin} HTTP/1.1\r\n\r\nEARLY").as_bytes())
        .await
        .unwrap();

    assert_eq!(
        read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await,
        CONNECT_ESTABLISHED
    );
    assert_eq!(read_exact_len(&mut client, 5).await, b"EARLY");
    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_split_across_writes() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator, true, Duration::from_secs(15)).await;
    let origin = echo_origin().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"CONN").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .write_all(format!("ECT 127.0.0.1:{origin} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    assert_eq!(
        read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await,
        CONNECT_ESTABLISHED
    );
    proxy.stop().await;
}

#[tokio::test]
async fn test_revalidation_runs_one_check_at_a_time() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator.clone(), true, Duration::from_millis(50)).await;
    let origin = echo_origin().await;

    let mut client = open_tunnel(port, &format!("127.0.0.1:{origin}")).await;
    read_exact_len(&mut client, CONNECT_ESTABLISHED.len()).await;

    // Each re-check outlasts several ticks.
    validator.delay_ms.store(250, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(validator.max_in_flight.load(Ordering::SeqCst), 1);
    // Initial check plus at most one re-check per 250 ms.
    assert!(validator.calls() <= 5, "calls = {}", validator.calls());
    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_len(&mut client, 4).await, b"ping");
    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_unreachable_is_bad_gateway() {
    let validator = Arc::new(SwitchValidator::default());
    let (proxy, port) = start_proxy(validator, true, Duration::from_secs(15)).await;
    let closed = closed_port().await;

    let response = http_get(port, &format!("http://127.0.0.1:{closed}/")).await;

    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains("Error: could not connect to the website"));
    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_silent_origin_is_gateway_timeout() {
    let validator = Arc::new(SwitchValidator::default());
    let options = ProxyOptions {
        port: 0,
        upstream_timeout: Duration::from_millis(200),
        ..ProxyOptions::default()
    };
    let (proxy, port) = start_proxy_with(validator, true, options).await;
    let origin = silent_origin().await;

    let response = http_get(port, &format!("http://127.0.0.1:{origin}/")).await;

    assert!(response.starts_with("HTTP/1.1 504"), "{response}");
    proxy.stop().await;
}

#[tokio::test]
async fn test_slow_upload_is_not_cut_off() {
    let validator = Arc::new(SwitchValidator::default());
    let options = ProxyOptions {
        port: 0,
        upstream_timeout: Duration::from_millis(200),
        ..ProxyOptions::default()
    };
    let (proxy, port) = start_proxy_with(validator, true, options).await;
    let origin = upload_origin().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(
            format!(
                "POST http://127.0.0.1:{origin}/answers HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\nConnection: close\r\n\r\nfirst"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    // The upload takes longer than the upstream timeout.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.write_all(b"-half").await.unwrap();

    let response = String::from_utf8(read_all(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("done"));
    proxy.stop().await;
}
