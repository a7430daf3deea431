//! Parsed snapshot of the OS proxy switch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{SysProxyError, SysProxyResult};

/// Port value meaning "absent or not a number".
pub const UNPARSEABLE_PORT: i32 = -1;

/// Current OS proxy configuration as seen by the integrity monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySystemSettings {
    /// Whether the proxy switch is on.
    pub enabled: bool,
    /// Proxy host without scheme.
    pub server: String,
    /// Proxy port, [`UNPARSEABLE_PORT`] when missing or invalid, `0` when
    /// the settings could not be read at all.
    pub port: i32,
}

impl ProxySystemSettings {
    /// Settings reported when the OS state could not be read.
    pub fn unreadable() -> Self {
        Self {
            enabled: false,
            server: String::new(),
            port: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    enabled: Value,
    #[serde(default)]
    server: Option<String>,
}

/// Parse the JSON printed by the read script.
///
/// `enabled` may be a boolean or `0`/`1`. `server` may carry an
/// `http://`/`https://` prefix; host and port are split on the last colon.
pub fn parse_settings(output: &str) -> SysProxyResult<ProxySystemSettings> {
    let raw: RawSettings = serde_json::from_str(output.trim())
        .map_err(|e| SysProxyError::Parse(format!("{}: {:?}", e, output.trim())))?;

    let enabled = match raw.enabled {
        Value::Bool(enabled) => enabled,
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    };

    let (server, port) = match raw.server.as_deref().filter(|s| !s.is_empty()) {
        Some(server) => split_server(server),
        None => ("localhost".to_string(), UNPARSEABLE_PORT),
    };

    Ok(ProxySystemSettings {
        enabled,
        server,
        port,
    })
}

fn split_server(server: &str) -> (String, i32) {
    let clean = server
        .strip_prefix("http://")
        .or_else(|| server.strip_prefix("https://"))
        .unwrap_or(server);

    match clean.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.trim().parse::<u16>().map_or(UNPARSEABLE_PORT, i32::from);
            (host.to_string(), port)
        }
        None => (clean.to_string(), UNPARSEABLE_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheme_prefixed_server() {
        let settings = parse_settings(r#"{"enabled":true,"server":"http://localhost:8888"}"#).unwrap();
        assert_eq!(
            settings,
            ProxySystemSettings {
                enabled: true,
                server: "localhost".to_string(),
                port: 8888,
            }
        );
    }

    #[test]
    fn test_parse_numeric_enabled_flag() {
        let on = parse_settings(r#"{"enabled":1,"server":"127.0.0.1:8888"}"#).unwrap();
        let off = parse_settings(r#"{"enabled":0,"server":"127.0.0.1:8888"}"#).unwrap();
        assert!(on.enabled);
        assert!(!off.enabled);
    }

    #[test]
    fn test_parse_splits_on_last_colon() {
        let settings = parse_settings(r#"{"enabled":true,"server":"https://proxy:corp:3128"}"#).unwrap();
        assert_eq!(settings.server, "proxy:corp");
        assert_eq!(settings.port, 3128);
    }

    #[test]
    fn test_parse_without_port() {
        let settings = parse_settings(r#"{"enabled":true,"server":"proxy.corp"}"#).unwrap();
        assert_eq!(settings.server, "proxy.corp");
        assert_eq!(settings.port, UNPARSEABLE_PORT);
    }

    #[test]
    fn test_parse_bad_port() {
        let settings = parse_settings(r#"{"enabled":true,"server":"localhost:http"}"#).unwrap();
        assert_eq!(settings.server, "localhost");
        assert_eq!(settings.port, UNPARSEABLE_PORT);
    }

    #[test]
    fn test_parse_empty_server() {
        let settings = parse_settings(r#"{"enabled":false,"server":""}"#).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.port, UNPARSEABLE_PORT);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_settings("Get-ItemProperty : access denied").unwrap_err();
        assert!(matches!(err, SysProxyError::Parse(_)));
    }

    #[test]
    fn test_unreadable_settings() {
        let settings = ProxySystemSettings::unreadable();
        assert!(!settings.enabled);
        assert_eq!(settings.server, "");
        assert_eq!(settings.port, 0);
    }
}
