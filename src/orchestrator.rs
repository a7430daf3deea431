//! Session lifecycle orchestration.
//!
//! The [`Orchestrator`] owns the forwarding proxy and the integrity monitor
//! of the single session a process may hold. It sequences bring-up
//! (authenticate, start the proxy, point the system proxy at it, start the
//! monitor) and the best-effort teardown, and turns tampering reports from
//! the monitor into the session's tampering response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, ConfigError};
use crate::monitor::{IntegrityMonitor, MonitorEvent, MonitorOptions, TamperingEvent};
use crate::proxy::{ForwardingProxy, ProxyConfig, ProxyConfigUpdate, ProxyError, ProxyOptions};
use crate::remote::{RemoteError, SecurityLogEntry, SessionApi, Validator};
use crate::sysproxy::{SysProxyError, SystemProxy};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Upper bound on each teardown step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The authority rejected the event key, or could not be asked.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The forwarding proxy could not be started.
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// The system proxy could not be configured.
    #[error("System proxy error: {0}")]
    SystemProxy(#[from] SysProxyError),

    /// The operation needs an authenticated session.
    #[error("No event key: connect first")]
    NoEventKey,

    /// Another connect, disconnect or stop is already running.
    #[error("Another session operation is in progress")]
    Busy,

    /// The authority did not confirm that monitoring stopped.
    #[error("Monitoring stop not confirmed after {attempts} attempt(s)")]
    MonitoringStop {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session.
    #[default]
    Idle,
    /// `connect` is running.
    Connecting,
    /// Proxy, system proxy and monitor are up.
    Connected,
    /// `disconnect` is running.
    Disconnecting,
}

/// Snapshot of the session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Event key of the authenticated session.
    pub event_key: Option<String>,
    /// Lifecycle phase.
    pub phase: SessionPhase,
    /// Whether requests are being validated.
    pub monitoring_active: bool,
    /// Port the forwarding proxy is bound to.
    pub local_port: Option<u16>,
}

/// Tampering details handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TamperingNotice {
    /// What the monitor found wrong.
    pub reason: String,
    /// When tampering was detected.
    pub timestamp: DateTime<Utc>,
}

/// Callbacks into the parts of the client outside this crate.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Tell the user that tampering was detected.
    async fn notify_tampering(&self, notice: TamperingNotice);

    /// Stop scheduling screen and media capture.
    async fn stop_capture(&self);
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl SessionHooks for NoopHooks {
    async fn notify_tampering(&self, _notice: TamperingNotice) {}

    async fn stop_capture(&self) {}
}

/// Tunables for one orchestrator.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Forwarding proxy options.
    pub proxy: ProxyOptions,
    /// Host name reported to the backend with each validation.
    pub remote_host: String,
    /// Backend base URL handed to the proxy's validator.
    pub api_base_url: Url,
    /// Integrity monitor options.
    pub monitor: MonitorOptions,
    /// Wait between the tampering notice and stopping capture.
    pub tampering_grace: Duration,
    /// Remote stop-monitoring attempts.
    pub stop_attempts: u32,
    /// Delay between stop-monitoring attempts.
    pub stop_retry_delay: Duration,
    /// Upper bound on each teardown step.
    pub step_timeout: Duration,
}

impl SessionSettings {
    /// Settings from loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            proxy: ProxyOptions {
                host: config.proxy.host().to_string(),
                port: config.proxy.port(),
                stop_grace: config.proxy.stop_grace(),
                ..ProxyOptions::default()
            },
            remote_host: config.api.remote_host().to_string(),
            api_base_url: config.api.base_url()?,
            monitor: MonitorOptions {
                interval: config.monitor.interval(),
                failure_threshold: config.monitor.failure_threshold(),
            },
            tampering_grace: config.session.tampering_grace(),
            stop_attempts: config.session.stop_attempts(),
            stop_retry_delay: config.session.stop_retry_delay(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        })
    }
}

/// External services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Session-level backend calls.
    pub api: Arc<dyn SessionApi>,
    /// Per-request policy decisions for the proxy.
    pub validator: Arc<dyn Validator>,
    /// OS proxy switch.
    pub system_proxy: Arc<dyn SystemProxy>,
    /// Presentation and capture callbacks.
    pub hooks: Arc<dyn SessionHooks>,
    /// Audit trail.
    pub audit: Arc<AuditLogger>,
}

struct Inner {
    settings: SessionSettings,
    api: Arc<dyn SessionApi>,
    validator: Arc<dyn Validator>,
    system_proxy: Arc<dyn SystemProxy>,
    hooks: Arc<dyn SessionHooks>,
    audit: Arc<AuditLogger>,
    session: Mutex<Session>,
    proxy: Mutex<Option<Arc<ForwardingProxy>>>,
    monitor: IntegrityMonitor,
    /// Routes monitor events; replaced on every connect.
    router: Mutex<Option<JoinHandle<()>>>,
    tampering_in_progress: AtomicBool,
    stop_in_progress: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears a re-entry flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Session lifecycle controller. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an idle orchestrator.
    pub fn new(settings: SessionSettings, collaborators: Collaborators) -> Self {
        let monitor = IntegrityMonitor::new(
            collaborators.system_proxy.clone(),
            settings.proxy.port,
            settings.monitor,
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                api: collaborators.api,
                validator: collaborators.validator,
                system_proxy: collaborators.system_proxy,
                hooks: collaborators.hooks,
                audit: collaborators.audit,
                session: Mutex::new(Session::default()),
                proxy: Mutex::new(None),
                monitor,
                router: Mutex::new(None),
                tampering_in_progress: AtomicBool::new(false),
                stop_in_progress: AtomicBool::new(false),
            }),
        }
    }

    /// Open a session for `event_key` and return the local proxy port.
    ///
    /// A proxy that is already running is reused with its port unchanged.
    /// Steps completed before a failure are not rolled back; call
    /// [`Orchestrator::disconnect`] to clean up.
    pub async fn connect(&self, event_key: &str) -> SessionResult<u16> {
        let previous = {
            let mut session = lock(&self.inner.session);
            if matches!(session.phase, SessionPhase::Connecting | SessionPhase::Disconnecting) {
                return Err(SessionError::Busy);
            }
            std::mem::replace(&mut session.phase, SessionPhase::Connecting)
        };

        let result = self.inner.establish(event_key).await;

        let mut session = lock(&self.inner.session);
        match result {
            Ok(port) => {
                session.phase = SessionPhase::Connected;
                session.local_port = Some(port);
                drop(session);
                self.inner.audit.log(AuditEvent::SessionConnect { port });
                info!("Session connected on port {}", port);
            }
            Err(ref e) => {
                session.phase = previous;
                warn!("Session connect failed: {}", e);
            }
        }
        result
    }

    /// Tear the session down.
    ///
    /// Every step runs even when an earlier one fails; failures are logged.
    /// Only a concurrent session operation makes this return an error.
    pub async fn disconnect(&self) -> SessionResult<()> {
        {
            let mut session = lock(&self.inner.session);
            if matches!(session.phase, SessionPhase::Connecting | SessionPhase::Disconnecting) {
                return Err(SessionError::Busy);
            }
            session.phase = SessionPhase::Disconnecting;
        }
        self.inner.teardown().await;
        Ok(())
    }

    /// Ask the authority to switch monitoring on.
    ///
    /// On success request validation starts immediately. Returns whether
    /// the authority accepted; without a connected session it is not asked.
    pub async fn start_monitoring(&self) -> bool {
        if !self.is_connected() || self.inner.proxy().is_none() {
            warn!("Cannot start monitoring without a connected session");
            return false;
        }
        let Some(event_key) = self.event_key() else {
            warn!("Cannot start monitoring without an event key");
            return false;
        };

        match self.inner.api.start_monitoring(&event_key).await {
            Ok(()) => {
                self.inner.set_monitoring(true);
                info!("Monitoring started");
                true
            }
            Err(e) => {
                warn!("Failed to start monitoring: {}", e);
                false
            }
        }
    }

    /// Ask the authority to switch monitoring off, retrying transient
    /// failures.
    ///
    /// Local monitoring is off afterwards whatever the authority answered.
    pub async fn stop_monitoring(&self) -> SessionResult<()> {
        self.inner.stop_monitoring().await
    }

    /// Push a partial configuration update into the running proxy.
    pub fn update_proxy_config(&self, update: ProxyConfigUpdate) {
        if let Some(proxy) = self.inner.proxy() {
            proxy.update_config(update);
        }
    }

    /// Whether a session is fully connected.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.session).phase == SessionPhase::Connected
    }

    /// Port of the running proxy.
    pub fn local_port(&self) -> Option<u16> {
        lock(&self.inner.session).local_port
    }

    /// Event key of the current session.
    pub fn event_key(&self) -> Option<String> {
        lock(&self.inner.session).event_key.clone()
    }

    /// Whether requests are being validated.
    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner.session).monitoring_active
    }

    /// Copy of the session state.
    pub fn session(&self) -> Session {
        lock(&self.inner.session).clone()
    }

    /// Whether the integrity monitor is polling.
    pub fn is_monitor_active(&self) -> bool {
        self.inner.monitor.is_active()
    }

    /// Whether the OS proxy currently points at this session's proxy.
    pub async fn is_proxy_setup(&self) -> bool {
        let port = self.local_port().unwrap_or(self.inner.settings.proxy.port);
        self.inner
            .system_proxy
            .is_enabled_for(&self.inner.settings.proxy.host, port)
            .await
    }
}

impl Inner {
    fn proxy(&self) -> Option<Arc<ForwardingProxy>> {
        lock(&self.proxy).clone()
    }

    fn event_key(&self) -> Option<String> {
        lock(&self.session).event_key.clone()
    }

    fn is_monitoring(&self) -> bool {
        lock(&self.session).monitoring_active
    }

    fn set_monitoring(&self, enabled: bool) {
        lock(&self.session).monitoring_active = enabled;
        if let Some(proxy) = self.proxy() {
            proxy.update_config(ProxyConfigUpdate::monitoring(enabled));
        }
    }

    async fn establish(self: &Arc<Self>, event_key: &str) -> SessionResult<u16> {
        self.api
            .authenticate(event_key)
            .await
            .map_err(|e| match e {
                RemoteError::Authentication(message) => SessionError::Authentication(message),
                other => SessionError::Authentication(other.to_string()),
            })?;
        lock(&self.session).event_key = Some(event_key.to_string());
        debug!("Event key accepted");

        let port = match self.proxy().filter(|proxy| proxy.is_active()) {
            Some(proxy) => {
                proxy.update_config(ProxyConfigUpdate {
                    event_key: Some(event_key.to_string()),
                    ..ProxyConfigUpdate::default()
                });
                let port = proxy.get_port();
                debug!("Reusing running proxy on port {}", port);
                port
            }
            None => self.start_proxy(event_key).await?,
        };

        self.system_proxy
            .enable(&self.settings.proxy.host, port)
            .await?;
        info!("System proxy set to {}:{}", self.settings.proxy.host, port);

        self.monitor.update_expected_port(port);
        let events = self.monitor.subscribe();
        let router = tokio::spawn(route_monitor_events(Arc::downgrade(self), events));
        if let Some(previous) = lock(&self.router).replace(router) {
            previous.abort();
        }
        self.monitor.start();

        Ok(port)
    }

    async fn start_proxy(&self, event_key: &str) -> SessionResult<u16> {
        let config = ProxyConfig {
            event_key: event_key.to_string(),
            remote_host: self.settings.remote_host.clone(),
            api_base_url: self.settings.api_base_url.clone(),
            is_monitoring: self.is_monitoring(),
        };
        let proxy = Arc::new(ForwardingProxy::new(
            self.settings.proxy.clone(),
            config,
            self.validator.clone(),
            self.audit.clone(),
        ));

        let port = proxy.start().await?;
        *lock(&self.proxy) = Some(proxy);
        Ok(port)
    }

    async fn teardown(&self) {
        let step_timeout = self.settings.step_timeout;

        self.monitor.stop();
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }

        let proxy = lock(&self.proxy).take();
        if let Some(proxy) = proxy {
            if tokio::time::timeout(step_timeout, proxy.stop()).await.is_err() {
                warn!("Proxy stop exceeded {:?}", step_timeout);
            }
        }

        match tokio::time::timeout(step_timeout, self.system_proxy.disable()).await {
            Ok(Ok(())) => info!("System proxy disabled"),
            Ok(Err(e)) => warn!("Failed to disable system proxy: {}", e),
            Err(_) => warn!("System proxy disable exceeded {:?}", step_timeout),
        }

        if let Some(event_key) = self.event_key() {
            match tokio::time::timeout(step_timeout, self.api.disconnect(&event_key)).await {
                Ok(Ok(())) => debug!("Authority notified of disconnect"),
                Ok(Err(e)) => warn!("Failed to notify authority of disconnect: {}", e),
                Err(_) => warn!("Disconnect notification exceeded {:?}", step_timeout),
            }
        }

        let port = {
            let mut session = lock(&self.session);
            let port = session.local_port;
            *session = Session::default();
            port
        };
        self.audit.log(AuditEvent::SessionDisconnect { port });
        info!("Session disconnected");
    }

    async fn stop_monitoring(&self) -> SessionResult<()> {
        let Some(_guard) = FlagGuard::acquire(&self.stop_in_progress) else {
            debug!("Monitoring stop already in progress");
            return Err(SessionError::Busy);
        };

        let outcome = match self.event_key() {
            Some(event_key) => self.stop_remote_with_retry(&event_key).await,
            None => Err(SessionError::NoEventKey),
        };

        self.set_monitoring(false);
        self.audit.log(AuditEvent::MonitoringStop {
            remote_confirmed: outcome.is_ok(),
        });
        outcome
    }

    async fn stop_remote_with_retry(&self, event_key: &str) -> SessionResult<()> {
        let attempts = self.settings.stop_attempts.max(1);

        for attempt in 1..=attempts {
            match self.api.stop_monitoring(event_key).await {
                Ok(()) => {
                    info!("Monitoring stopped (attempt {})", attempt);
                    return Ok(());
                }
                Err(e) if e.is_client_error() => {
                    warn!("Monitoring stop rejected: {}", e);
                    return Err(SessionError::MonitoringStop { attempts: attempt });
                }
                Err(e) => {
                    warn!("Monitoring stop attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.stop_retry_delay).await;
                    }
                }
            }
        }

        Err(SessionError::MonitoringStop { attempts })
    }

    async fn respond_to_tampering(&self, event: TamperingEvent) {
        let Some(_guard) = FlagGuard::acquire(&self.tampering_in_progress) else {
            debug!("Tampering response already running, dropping report");
            return;
        };
        if !self.is_monitoring() {
            debug!("Monitoring inactive, ignoring tampering: {}", event.reason);
            return;
        }

        if let Some(event_key) = self.event_key() {
            let entry = SecurityLogEntry::proxy_tampering(&event.reason, event.timestamp);
            if let Err(e) = self.api.log_security_event(&event_key, &entry).await {
                warn!("Failed to report tampering: {}", e);
            }
        }

        self.hooks
            .notify_tampering(TamperingNotice {
                reason: event.reason.clone(),
                timestamp: event.timestamp,
            })
            .await;

        tokio::time::sleep(self.settings.tampering_grace).await;
        self.hooks.stop_capture().await;

        if let Err(e) = self.stop_monitoring().await {
            error!("Monitoring stop after tampering failed: {}", e);
        }
    }
}

async fn route_monitor_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<MonitorEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            MonitorEvent::TamperingDetected(tampering) => {
                inner.audit.log(AuditEvent::TamperingDetected {
                    reason: tampering.reason.clone(),
                    consecutive_failures: tampering.consecutive_failures,
                });
                // A separate task so the grace sleep never holds up routing.
                tokio::spawn(async move { inner.respond_to_tampering(tampering).await });
            }
            MonitorEvent::ProxyRestored => {
                inner.audit.log(AuditEvent::ProxyRestored);
                info!("System proxy restored");
            }
        }
    }
}
