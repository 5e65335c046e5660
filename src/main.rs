use anyhow::Result;
use clap::Parser;

mod auth;
mod budget;
mod cli;
mod commands;
mod config;
mod daemon;
mod platform;
mod remote;

use cli::{Args, Commands, ConfigCommands};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Start => commands::local::start(args.config, args.data_dir, args.verbose),
        Commands::Status => commands::local::status(args.config, args.data_dir, args.verbose),
        Commands::Extend { minutes } => {
            commands::local::extend(args.config, args.data_dir, minutes, args.verbose)
        }
        Commands::Grant { minutes, password } => {
            commands::local::grant(args.config, args.data_dir, minutes, password, args.verbose)
        }
        Commands::DeviceId => commands::local::device_id(args.data_dir, args.verbose),
        Commands::Config { command } => match command {
            ConfigCommands::Init { output, force } => {
                commands::local::config_init(output.or(args.config), force)
            }
            ConfigCommands::SetPassword { password } => {
                commands::local::set_password(args.config, password)
            }
        },
        Commands::Parent { command } => commands::run_parent_command(command, args.verbose),
    }
}
