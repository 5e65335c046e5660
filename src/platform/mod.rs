/// Desktop integration: screen locking, notifications and session state
pub mod common;
pub mod session;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

use anyhow::Result;

pub use session::{DesktopProbe, ScreenStateMonitor, SessionEventLog};

/// Lock the screen using the platform-specific mechanism
pub fn lock_screen() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::lock_screen()
    }

    #[cfg(target_os = "macos")]
    {
        macos::lock_screen()
    }

    #[cfg(target_os = "windows")]
    {
        windows::lock_screen()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system for screen locking")
    }
}

/// Whether the screen is currently in active use
///
/// Only Linux exposes idle and lock hints without extra privileges; elsewhere
/// the session is treated as always interactive.
pub fn is_interactive() -> bool {
    #[cfg(target_os = "linux")]
    {
        linux::is_interactive()
    }

    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// Show a desktop notification
pub fn notify(title: &str, message: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::notify(title, message)
    }

    #[cfg(target_os = "macos")]
    {
        macos::notify(title, message)
    }

    #[cfg(target_os = "windows")]
    {
        windows::notify(title, message)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        tracing::warn!("Notification: {} - {}", title, message);
        Ok(())
    }
}
