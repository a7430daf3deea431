//! System proxy integrity monitoring.
//!
//! While a session is connected the OS proxy switch must keep pointing at
//! the local forwarding proxy. [`IntegrityMonitor`] polls it and, after a
//! run of failing checks, reports tampering; the first passing check
//! afterwards reports restoration.

mod check;
mod integrity;

pub use check::{FailureStreak, MonitorEvent, TamperingEvent, find_mismatch};
pub use integrity::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_FAILURE_THRESHOLD, IntegrityMonitor, MonitorOptions,
};
