//! TLS towards upstream servers for absolute `https://` requests.
//!
//! CONNECT tunnels are never terminated here; they stay opaque end to end.
//! Only plain proxy requests that name an `https://` URL are re-originated
//! over TLS by the proxy itself.
//!
//! ALPN is pinned to `http/1.1` because the forwarding path speaks HTTP/1.1
//! to the origin.

use super::error::{ProxyError, ProxyResult};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Create a TLS connector for upstream connections.
///
/// Trusts the platform's native root certificates.
pub fn create_tls_connector() -> ProxyResult<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host name or IP literal to a rustls ServerName.
pub fn domain_to_server_name(domain: &str) -> ProxyResult<ServerName<'static>> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}

/// Lazily built connector shared by all connections of one proxy.
///
/// Loading the native root store is slow, so it happens on the first
/// `https://` request rather than at startup.
#[derive(Default)]
pub struct UpstreamTls {
    connector: OnceCell<TlsConnector>,
}

impl UpstreamTls {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the connector, building it on first use.
    pub async fn connector(&self) -> ProxyResult<TlsConnector> {
        self.connector
            .get_or_try_init(|| async { create_tls_connector() })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_to_server_name() {
        assert!(domain_to_server_name("example.com").is_ok());
        assert!(domain_to_server_name("127.0.0.1").is_ok());
    }

    #[test]
    fn test_invalid_server_name() {
        let err = domain_to_server_name("bad host").unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
    }
}
