use anyhow::Result;

use super::common::try_command;

/// Lock the screen via the System Events lock shortcut
pub fn lock_screen() -> Result<()> {
    try_command(
        "osascript",
        &[
            "-e",
            "tell application \"System Events\" to keystroke \"q\" using {command down, control down}",
        ],
    )
}

pub fn notify(title: &str, message: &str) -> Result<()> {
    let script = format!(
        "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
        message.replace('"', "'"),
        title.replace('"', "'")
    );
    try_command("osascript", &["-e", &script])
}
