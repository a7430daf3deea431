//! proctor-proxy: network interception core of a remote-proctoring client
//!
//! While an exam session is open, all HTTP and HTTPS traffic of the machine
//! is routed through a local forwarding proxy that asks the proctoring
//! backend whether each request may pass. The system proxy setting is
//! watched so that switching it off or pointing it elsewhere is noticed.
//!
//! # Security Model
//!
//! The security model is **fail-closed**: a request the backend cannot
//! decide on is blocked. Tunnels are re-validated while open and torn down
//! when their target becomes disallowed.
//!
//! # Architecture
//!
//! - **Proxy**: HTTP forwarding and CONNECT tunnels with live policy checks
//! - **Monitor**: Polls the OS proxy switch and reports tampering
//! - **Orchestrator**: Session lifecycle and the tampering response
//! - **Remote**: Client for the proctoring backend
//! - **Sysproxy**: Reads and writes the OS proxy switch
//! - **Config**: Hierarchical TOML configuration
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod monitor;
pub mod orchestrator;
pub mod proxy;
pub mod remote;
pub mod sysproxy;
pub mod telemetry;
