//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/proctor-proxy/config.toml`
//! 3. User config: `~/.config/proctor-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. Environment (`PROCTOR_ENV`, `PROCTOR_API_BASE_URL`, `PROXY_HOST`)
//! 6. CLI flags (highest priority)
//!
//! Lists (bypass) are **merged** (appended).
//! Scalars (port, timeouts) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, DEVELOPMENT_API_URL};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/proctor-proxy/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "proctor-proxy";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Selects the backend; `development` points at a local one.
pub const ENV_PROFILE: &str = "PROCTOR_ENV";

/// Explicit backend base URL.
pub const ENV_API_BASE_URL: &str = "PROCTOR_API_BASE_URL";

/// Listen address of the local proxy.
pub const ENV_PROXY_HOST: &str = "PROXY_HOST";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources, reading the process
    /// environment.
    ///
    /// Missing system and user files are skipped. A missing `--config` file
    /// and invalid TOML anywhere are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        self.load_with_env(cli, |name| std::env::var(name).ok())
    }

    /// Same as [`ConfigLoader::load`] with an injected environment lookup.
    pub fn load_with_env<F>(&self, cli: &Cli, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        // Load and merge system config
        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        // Load and merge user config
        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        // Load and merge additional config file from CLI
        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        apply_env(&mut config, env);

        // Apply CLI flags (highest priority)
        if let Some(ref api_url) = cli.api_url {
            config.api.base_url = Some(api_url.clone());
            debug!("Backend URL set from CLI: {}", api_url);
        }

        // Surface a bad URL at load time rather than at first use.
        config.api.base_url()?;

        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply environment overrides. An explicit base URL beats the profile.
fn apply_env<F>(config: &mut Config, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| env(name).filter(|value| !value.trim().is_empty());

    if non_empty(ENV_PROFILE).is_some_and(|profile| profile.eq_ignore_ascii_case("development")) {
        config.api.base_url = Some(DEVELOPMENT_API_URL.to_string());
        debug!("Development profile selected, backend {}", DEVELOPMENT_API_URL);
    }
    if let Some(url) = non_empty(ENV_API_BASE_URL) {
        config.api.base_url = Some(url);
    }
    if let Some(host) = non_empty(ENV_PROXY_HOST) {
        config.proxy.host = Some(host);
    }
}
