use anyhow::Result;
use tracing::debug;

use super::common::{command_output, try_command};

/// Lock the screen, trying the common Linux lockers in order of preference
pub fn lock_screen() -> Result<()> {
    let lockers: &[(&str, &[&str])] = &[
        ("loginctl", &["lock-session"]),
        ("xdg-screensaver", &["lock"]),
        ("gnome-screensaver-command", &["--lock"]),
        ("cinnamon-screensaver-command", &["--lock"]),
        ("mate-screensaver-command", &["--lock"]),
        ("xscreensaver-command", &["-lock"]),
        ("light-locker-command", &["--lock"]),
    ];

    for (cmd, args) in lockers {
        if try_command(cmd, args).is_ok() {
            debug!("Screen locked via {}", cmd);
            return Ok(());
        }
    }

    anyhow::bail!("No supported screen lock mechanism found on this Linux system")
}

/// Whether the logind session is in active use (not idle and not locked)
///
/// Falls back to `true` when logind cannot be queried, so usage is never
/// silently under-counted.
pub fn is_interactive() -> bool {
    let session = std::env::var("XDG_SESSION_ID").unwrap_or_else(|_| "self".to_string());

    match command_output(
        "loginctl",
        &["show-session", &session, "-p", "IdleHint", "-p", "LockedHint", "--value"],
    ) {
        Ok(output) => parse_session_hints(&output),
        Err(e) => {
            debug!("Session probe unavailable, assuming interactive: {:#}", e);
            true
        }
    }
}

/// `loginctl --value` prints one `yes`/`no` line per requested property
fn parse_session_hints(output: &str) -> bool {
    !output.lines().any(|line| line.trim() == "yes")
}

/// Send a desktop notification via notify-send
pub fn notify(title: &str, message: &str) -> Result<()> {
    try_command(
        "notify-send",
        &[title, message, "--urgency=critical", "--icon=dialog-warning"],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_hints_active() {
        assert!(parse_session_hints("no\nno\n"));
    }

    #[test]
    fn test_parse_session_hints_idle_or_locked() {
        assert!(!parse_session_hints("yes\nno"));
        assert!(!parse_session_hints("no\nyes"));
    }
}
