use anyhow::Result;
use tracing::warn;

use super::common::try_command;

pub fn lock_screen() -> Result<()> {
    try_command("rundll32.exe", &["user32.dll,LockWorkStation"])
}

/// Toast notifications need the WinRT APIs; log instead
pub fn notify(title: &str, message: &str) -> Result<()> {
    warn!("Notification: {} - {}", title, message);
    Ok(())
}
