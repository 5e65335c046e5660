use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::remote::protocol::MAX_EXTEND_MINUTES;

/// Daily screen-time budget enforcer
///
/// Tracks interactive screen use, locks the screen once today's budget is
/// spent, and optionally accepts encrypted commands from a parent device on
/// the local network.
#[derive(Parser, Debug)]
#[command(name = "screen-budget")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the platform location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for credits, identity and the usage log
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground until Ctrl+C
    Start,
    /// Show today's budget, usage and remote-control settings
    Status,
    /// Spend one of today's extension units
    Extend {
        /// Minutes wanted; under 5 uses a 1-minute unit when one is left
        #[arg(long, default_value = "5")]
        minutes: u32,
    },
    /// Add minutes to today's budget, authorized by the admin password
    Grant {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=MAX_EXTEND_MINUTES as i64))]
        minutes: u32,

        /// Admin password (prompted for on stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the device identifier, creating it if needed
    DeviceId,
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Control a device from the parent side
    Parent {
        #[command(subcommand)]
        command: ParentCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write a commented default configuration
    Init {
        /// Output path (defaults to the platform location)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Store the hash of a new admin password in the config file
    SetPassword {
        /// New password (prompted for on stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    /// Identifier shown by `screen-budget device-id` on the device
    #[arg(long)]
    pub device_id: String,

    /// Device address (as printed by `parent discover`)
    #[arg(long)]
    pub host: String,

    #[arg(long, default_value = "8888")]
    pub port: u16,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "3000")]
    pub timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum ParentCommands {
    /// Find devices on the local network
    Discover {
        #[arg(long, default_value = "8888")]
        port: u16,

        /// How long to wait for answers in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },
    /// Ask a device how much screen time is left
    TimeLeft {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Block a device for the rest of the day
    Lock {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Add minutes to today's budget on a device
    Extend {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=MAX_EXTEND_MINUTES as i64))]
        minutes: u32,
    },
}
