//! Reads and writes the OS proxy switch through a [`CommandRunner`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::SysProxyResult;
use super::runner::CommandRunner;
use super::scripts;
use super::settings::{ProxySystemSettings, parse_settings};

/// Default time allowed for a write (enable/disable) script.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// OS proxy switch operations.
///
/// All operations are idempotent.
#[async_trait]
pub trait SystemProxy: Send + Sync {
    /// Route system traffic through `host:port`.
    async fn enable(&self, host: &str, port: u16) -> SysProxyResult<()>;

    /// Stop routing system traffic through any proxy.
    async fn disable(&self) -> SysProxyResult<()>;

    /// Whether the switch is on and points at exactly `host:port`.
    ///
    /// Failures read as `false`.
    async fn is_enabled_for(&self, host: &str, port: u16) -> bool;

    /// Current settings. Failures read as [`ProxySystemSettings::unreadable`].
    async fn read_current(&self) -> ProxySystemSettings;
}

/// [`SystemProxy`] backed by platform scripts.
pub struct SystemProxyConfigurator {
    runner: Arc<dyn CommandRunner>,
    bypass: Vec<String>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SystemProxyConfigurator {
    /// Create a configurator.
    ///
    /// `bypass` is written as the proxy override list on enable; reads are
    /// bounded by `read_timeout`.
    pub fn new(runner: Arc<dyn CommandRunner>, bypass: Vec<String>, read_timeout: Duration) -> Self {
        Self {
            runner,
            bypass,
            read_timeout,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

#[async_trait]
impl SystemProxy for SystemProxyConfigurator {
    async fn enable(&self, host: &str, port: u16) -> SysProxyResult<()> {
        let script = scripts::set_proxy(host, port, &self.bypass);
        self.runner.run(&script, self.write_timeout).await?;
        info!("System proxy set to {}:{}", host, port);
        Ok(())
    }

    async fn disable(&self) -> SysProxyResult<()> {
        self.runner
            .run(&scripts::unset_proxy(), self.write_timeout)
            .await?;
        info!("System proxy disabled");
        Ok(())
    }

    async fn is_enabled_for(&self, host: &str, port: u16) -> bool {
        let script = scripts::is_proxy_connected(host, port);
        match self.runner.run(&script, self.read_timeout).await {
            Ok(output) => output.trim() == "true",
            Err(e) => {
                warn!("Failed to query system proxy state: {}", e);
                false
            }
        }
    }

    async fn read_current(&self) -> ProxySystemSettings {
        let output = match self.runner.run(&scripts::read_proxy(), self.read_timeout).await {
            Ok(output) => output,
            Err(e) => {
                debug!("Failed to read system proxy settings: {}", e);
                return ProxySystemSettings::unreadable();
            }
        };

        parse_settings(&output).unwrap_or_else(|e| {
            debug!("{}", e);
            ProxySystemSettings::unreadable()
        })
    }
}
