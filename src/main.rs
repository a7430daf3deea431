//! proctor-proxy: local forwarding proxy for proctored exam sessions
//!
//! This is the main entry point for the proctor-proxy binary. It handles CLI
//! argument parsing, configuration loading and logging setup, then runs the
//! requested subcommand.
//!
//! # Logging
//!
//! - **Audit logging**: Goes to syslog, independent of verbosity
//! - **Debug logging**: `tracing` output on stderr, level chosen by `-v`

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use proctor_proxy::{
    cli::{Cli, Commands},
    config::{Config, ConfigLoader},
    orchestrator::{
        Collaborators, Orchestrator, SessionHooks, SessionSettings, TamperingNotice,
    },
    remote::PolicyClient,
    sysproxy::{PowerShellRunner, SystemProxy, SystemProxyConfigurator},
    telemetry::AuditLogger,
};
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let system_proxy = Arc::new(SystemProxyConfigurator::new(
        Arc::new(PowerShellRunner),
        config.proxy.bypass(),
        config.monitor.read_timeout(),
    ));

    match cli.command {
        Commands::Connect { event_key, monitor } => {
            run_session(&config, system_proxy, &event_key, monitor).await
        }
        Commands::Disconnect => {
            system_proxy
                .disable()
                .await
                .context("Failed to disable system proxy")?;
            println!("System proxy disabled");
            Ok(())
        }
        Commands::Status => {
            let settings = system_proxy.read_current().await;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run_session(
    config: &Config,
    system_proxy: Arc<SystemProxyConfigurator>,
    event_key: &str,
    monitor: bool,
) -> Result<()> {
    let settings = SessionSettings::from_config(config).context("Invalid configuration")?;
    let client = Arc::new(
        PolicyClient::new(settings.api_base_url.clone(), config.api.timeout())
            .context("Failed to create backend client")?,
    );
    let audit = Arc::new(AuditLogger::new().unwrap_or_else(|e| {
        warn!("Syslog unavailable, auditing to the log instead: {}", e);
        AuditLogger::new_tracing()
    }));

    let orchestrator = Orchestrator::new(
        settings,
        Collaborators {
            api: client.clone(),
            validator: client,
            system_proxy,
            hooks: Arc::new(ConsoleHooks),
            audit,
        },
    );

    let port = match orchestrator.connect(event_key).await {
        Ok(port) => port,
        Err(e) => {
            // Undo whatever the partial connect left behind.
            let _ = orchestrator.disconnect().await;
            return Err(e).context("Failed to open session");
        }
    };
    println!("Session open, proxy listening on port {}", port);

    if (monitor || config.session.start_monitoring()) && !orchestrator.start_monitoring().await {
        warn!("Backend did not accept monitoring start");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, closing session");

    orchestrator
        .disconnect()
        .await
        .context("Failed to close session")?;
    println!("Session closed");
    Ok(())
}

/// Hooks for a terminal session: notices go to stderr, there is no capture.
struct ConsoleHooks;

#[async_trait]
impl SessionHooks for ConsoleHooks {
    async fn notify_tampering(&self, notice: TamperingNotice) {
        eprintln!(
            "Proxy tampering detected at {}: {}",
            notice.timestamp.to_rfc3339(),
            notice.reason
        );
    }

    async fn stop_capture(&self) {
        debug!("No capture to stop");
    }
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else `general.log_level`, else warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, config_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fallback = if config_level.is_empty() { "warn" } else { config_level };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
