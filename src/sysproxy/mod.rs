//! OS-level proxy switch.
//!
//! On Windows the per-user WinINET settings (`ProxyEnable`, `ProxyServer`,
//! `ProxyOverride`) are read and written with short PowerShell scripts.
//! Script execution sits behind [`CommandRunner`] so the configurator can be
//! driven without a real shell.

mod configurator;
mod error;
mod runner;
pub mod scripts;
mod settings;

pub use configurator::{DEFAULT_WRITE_TIMEOUT, SystemProxy, SystemProxyConfigurator};
pub use error::{SysProxyError, SysProxyResult};
pub use runner::{CommandRunner, PowerShellRunner};
pub use settings::{ProxySystemSettings, UNPARSEABLE_PORT, parse_settings};
