//! Local forwarding proxy with live policy enforcement.
//!
//! The OS proxy switch points at this listener while a session is
//! connected, so every HTTP request and HTTPS tunnel of the machine passes
//! through it:
//! - Plain HTTP requests are checked and re-issued to their origin
//! - CONNECT tunnels are checked, spliced opaquely, and re-checked every
//!   15 seconds for as long as they stay open
//! - Checks only happen while the session is monitored, and any failure to
//!   reach the authority counts as a block
//!
//! # Architecture
//!
//! ```text
//!  browser / app
//!       │  CONNECT host:443  |  GET http://host/
//!       ▼
//! ┌──────────────────┐  validate   ┌──────────────────┐
//! │ ForwardingProxy  │────────────▶│ policy authority │
//! │ 127.0.0.1:8888   │◀────────────│  (remote API)    │
//! └────────┬─────────┘  blocked?   └──────────────────┘
//!          │ allowed
//!          ▼
//!     origin server
//! ```

pub mod connect;
pub mod error;
mod forward;
pub mod policy;
mod rewind;
pub mod server;
pub mod tls;

// Re-export main types for convenient access
pub use connect::{CONNECT_BAD_REQUEST, CONNECT_ESTABLISHED, CONNECT_FORBIDDEN, parse_host_port};
pub use error::{ProxyError, ProxyResult};
pub use forward::BLOCKED_PAGE;
pub use policy::{PolicyGate, ProxyConfig, ProxyConfigUpdate, SharedProxyConfig, header_map};
pub use server::{
    DEFAULT_PROXY_PORT, DEFAULT_REVALIDATE_INTERVAL, DEFAULT_STOP_GRACE, DEFAULT_UPSTREAM_TIMEOUT,
    ForwardingProxy, ProxyEvent, ProxyOptions, ProxyStatus,
};
