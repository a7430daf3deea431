//! Audit logging for proctoring sessions.
//!
//! Security-relevant events (session lifecycle, blocked traffic, proxy
//! tampering) are written to syslog with the `PROCTOR_PROXY` tag so they
//! survive independently of the diagnostic `tracing` output on stderr.
//! Without syslog (Windows) they are emitted through `tracing` under the
//! `audit` target.
//!
//! # Usage
//!
//! ```ignore
//! use proctor_proxy::telemetry::{AuditEvent, AuditLogger};
//!
//! let audit = AuditLogger::new().unwrap_or_else(|_| AuditLogger::new_null());
//! audit.log(AuditEvent::SessionConnect { port: 8888 });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-03-02T09:15:44Z","event":"tampering_detected","reason":"system proxy disabled","consecutive_failures":2}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use syslog::{AUDIT_TARGET, AuditLogger, SYSLOG_TAG};
