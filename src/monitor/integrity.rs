//! Polling loop that watches the OS proxy switch.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::check::{FailureStreak, MonitorEvent, find_mismatch};
use crate::sysproxy::SystemProxy;

/// Default time between checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(3000);
/// Default number of consecutive failing checks that count as tampering.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Timing options for [`IntegrityMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Time between checks.
    pub interval: Duration,
    /// Consecutive failing checks before tampering is raised.
    pub failure_threshold: u32,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

struct EpisodeState {
    streak: FailureStreak,
    /// Bumped on every stop so results of a cancelled loop are discarded.
    generation: u64,
}

struct Shared {
    reader: Arc<dyn SystemProxy>,
    expected_port: AtomicU16,
    state: Mutex<EpisodeState>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<MonitorEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    async fn check(&self, generation: Option<u64>) -> Option<MonitorEvent> {
        let settings = self.reader.read_current().await;
        let expected_port = self.expected_port.load(Ordering::SeqCst);
        let mismatch = find_mismatch(&settings, expected_port);

        let event = {
            let mut state = lock(&self.state);
            if generation.is_some_and(|g| g != state.generation) {
                return None;
            }
            state.streak.record(mismatch)
        }?;

        match lock(&self.subscriber).as_ref() {
            Some(tx) if tx.send(event.clone()).is_ok() => {}
            _ => debug!("No subscriber for monitor event {:?}", event),
        }
        Some(event)
    }
}

/// Watches the OS proxy switch and reports tampering.
///
/// Events go to at most one subscriber; see [`IntegrityMonitor::subscribe`].
pub struct IntegrityMonitor {
    shared: Arc<Shared>,
    options: MonitorOptions,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IntegrityMonitor {
    /// Create a stopped monitor expecting the proxy on `expected_port`.
    pub fn new(reader: Arc<dyn SystemProxy>, expected_port: u16, options: MonitorOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                reader,
                expected_port: AtomicU16::new(expected_port),
                state: Mutex::new(EpisodeState {
                    streak: FailureStreak::new(options.failure_threshold),
                    generation: 0,
                }),
                subscriber: Mutex::new(None),
            }),
            options,
            task: Mutex::new(None),
        }
    }

    /// Start polling. The first check runs immediately.
    ///
    /// No-op while already running. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let generation = lock(&self.shared.state).generation;
        let shared = self.shared.clone();
        let period = self.options.interval;

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                shared.check(Some(generation)).await;
            }
        }));
        info!(
            "Proxy integrity monitor started (port {}, every {:?})",
            self.expected_port(),
            period
        );
    }

    /// Stop polling and reset the failure streak.
    pub fn stop(&self) {
        let handle = lock(&self.task).take();
        {
            let mut state = lock(&self.shared.state);
            state.generation += 1;
            state.streak.reset();
        }
        if let Some(handle) = handle {
            handle.abort();
            info!("Proxy integrity monitor stopped");
        }
    }

    /// Whether the polling loop is running.
    pub fn is_active(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Change the port the OS proxy must point at. Applies from the next check.
    pub fn update_expected_port(&self, port: u16) {
        self.shared.expected_port.store(port, Ordering::SeqCst);
        debug!("Monitor now expects proxy port {}", port);
    }

    /// Port the OS proxy must point at.
    pub fn expected_port(&self) -> u16 {
        self.shared.expected_port.load(Ordering::SeqCst)
    }

    /// Failing checks in the current streak.
    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.shared.state).streak.consecutive_failures()
    }

    /// Register the single event subscriber.
    ///
    /// Replaces any previous subscriber, whose receiver then sees the channel
    /// close.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.subscriber) = Some(tx);
        rx
    }

    /// Run one check now, outside the polling schedule.
    pub async fn check_integrity(&self) -> Option<MonitorEvent> {
        self.shared.check(None).await
    }
}

impl Drop for IntegrityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}
