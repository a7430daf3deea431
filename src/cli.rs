//! Command-line interface definitions for proctor-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Local forwarding proxy for proctored exam sessions.
///
/// proctor-proxy routes the machine's web traffic through a local proxy,
/// asks the proctoring backend whether each request is allowed, and watches
/// the system proxy setting for tampering while a session is open.
#[derive(Parser, Debug)]
#[command(name = "proctor-proxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Proctoring backend base URL (overrides config and environment).
    #[arg(long = "api-url", value_name = "URL", global = true)]
    pub api_url: Option<String>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for proctor-proxy.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Open a session and keep it running until Ctrl-C.
    Connect {
        /// Event key issued by the proctoring backend.
        #[arg(long = "event-key", env = "PROCTOR_EVENT_KEY", value_name = "KEY")]
        event_key: String,

        /// Switch monitoring on right after connecting.
        #[arg(long = "monitor")]
        monitor: bool,
    },

    /// Turn the system proxy off, e.g. after a crashed session.
    Disconnect,

    /// Print the current system proxy settings as JSON.
    Status,
}
