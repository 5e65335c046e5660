use anyhow::{Context, Result};
use chrono::Duration;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, LoggingConfig};

/// Initialize logging
///
/// `RUST_LOG` wins; otherwise `--verbose` means debug, else the configured level.
pub fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}

/// Resolve the config path from the flag or the platform default
pub fn resolve_config_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => config::get_config_path(),
    }
}

pub fn resolve_data_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => config::get_data_dir(),
    }
}

/// Use the password given on the command line, or prompt for one line on stdin
pub fn read_password(flag: Option<String>, prompt: &str) -> Result<String> {
    let password = match flag {
        Some(password) => password,
        None => {
            eprint!("{}: ", prompt);
            io::stderr().flush().context("Failed to write prompt")?;

            let mut line = String::new();
            io::stdin()
                .read_line(&mut line)
                .context("Failed to read password")?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok(password)
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

/// Format a minute count as `1h 05m` or `25m`
pub fn format_minutes(minutes: i64) -> String {
    if minutes.abs() < 60 {
        format!("{}m", minutes)
    } else {
        let sign = if minutes < 0 { "-" } else { "" };
        let minutes = minutes.abs();
        format!("{}{}h {:02}m", sign, minutes / 60, minutes % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_units() {
        assert_eq!(format_duration(Duration::seconds(42)), "42s");
        assert_eq!(format_duration(Duration::seconds(600)), "10m");
        assert_eq!(format_duration(Duration::hours(5)), "5h");
        assert_eq!(format_duration(Duration::days(3)), "3d");
    }

    #[test]
    fn format_minutes_units() {
        assert_eq!(format_minutes(0), "0m");
        assert_eq!(format_minutes(25), "25m");
        assert_eq!(format_minutes(65), "1h 05m");
        assert_eq!(format_minutes(-3), "-3m");
        assert_eq!(format_minutes(-125), "-2h 05m");
    }

    #[test]
    fn password_flag_is_used_as_given() {
        assert_eq!(read_password(Some(" pw ".to_string()), "Password").unwrap(), " pw ");
        assert!(read_password(Some(String::new()), "Password").is_err());
    }

    #[test]
    fn flags_override_platform_paths() {
        let path = PathBuf::from("/tmp/custom.toml");
        assert_eq!(resolve_config_path(Some(path.clone())).unwrap(), path);

        let dir = PathBuf::from("/tmp/data");
        assert_eq!(resolve_data_dir(Some(dir.clone())).unwrap(), dir);
    }
}
