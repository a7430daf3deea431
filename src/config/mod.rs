//! Configuration system for proctor-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/proctor-proxy/config.toml`
//! 3. User config: `~/.config/proctor-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. Environment variables
//! 6. CLI flags (highest priority)
//!
//! No file is required; an empty hierarchy yields the defaults.
//!
//! # Merge Behavior
//!
//! - **Lists** (bypass) are **merged** (appended)
//! - **Scalars** are **overridden** when set
//!
//! ```toml
//! [api]
//! base_url = "https://backend-production-b180.up.railway.app"
//! timeout_ms = 10000
//!
//! [proxy]
//! port = 8888
//! bypass = ["*.intranet.example"]
//!
//! [monitor]
//! interval_ms = 3000
//! failure_threshold = 2
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{
    ConfigLoader, ENV_API_BASE_URL, ENV_PROFILE, ENV_PROXY_HOST, SYSTEM_CONFIG_PATH,
};
pub use schema::{
    ApiConfig, Config, DEFAULT_BYPASS, DEVELOPMENT_API_URL, GeneralConfig, MonitorConfig,
    PRODUCTION_API_URL, ProxySection, SessionConfig,
};
