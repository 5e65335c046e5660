use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::cli::{ParentCommands, TargetArgs};
use crate::config::LoggingConfig;
use crate::remote::{Command, ParentClient, Response, normalize_device_id};

use super::utils::init_logging;

/// Run parent-side subcommands
pub fn run_parent_command(command: ParentCommands, verbose: bool) -> Result<()> {
    init_logging(verbose, &LoggingConfig::default())?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match command {
            ParentCommands::Discover { port, timeout_ms } => discover(port, timeout_ms).await,
            ParentCommands::TimeLeft { target } => send(&target, Command::GetTimeLeft).await,
            ParentCommands::Lock { target } => send(&target, Command::LockDevice).await,
            ParentCommands::Extend { target, minutes } => {
                send(&target, Command::ExtendTime(minutes)).await
            }
        }
    })
}

async fn discover(port: u16, timeout_ms: u64) -> Result<()> {
    println!("Searching for devices on UDP port {}...", port);

    let client = ParentClient::new().await?;
    let devices = client
        .discover(port, Duration::from_millis(timeout_ms))
        .await?;

    if devices.is_empty() {
        println!("No devices answered within {} ms", timeout_ms);
        return Ok(());
    }

    for device in &devices {
        println!("✓ {}", device.ip());
    }

    Ok(())
}

async fn send(target: &TargetArgs, command: Command) -> Result<()> {
    let device_id = normalize_device_id(&target.device_id)?;
    let addr = resolve_target(&target.host, target.port)?;

    let client = ParentClient::new().await?;
    let response = client
        .send_command(addr, &device_id, &command, Duration::from_millis(target.timeout_ms))
        .await?;

    match response {
        Response::Error(message) => anyhow::bail!("Device reported an error: {}", message),
        Response::LockFailed => anyhow::bail!("{}", response),
        other => println!("✓ {}", other),
    }

    Ok(())
}

fn resolve_target(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve host: {}", host))?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("No IPv4 address found for host: {}", host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_address() {
        let addr = resolve_target("192.168.1.20", 8888).unwrap();
        assert_eq!(addr, "192.168.1.20:8888".parse().unwrap());
    }

    #[test]
    fn rejects_ipv6_only_literal() {
        assert!(resolve_target("::1", 8888).is_err());
    }
}
