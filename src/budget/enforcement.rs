use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::engine::UsageSnapshot;
use crate::platform;

/// Minimum gap before the same remaining-minute warning is repeated
pub const MIN_WARNING_INTERVAL_MS: i64 = 60_000;

/// Presents and tears down the blocked-state barrier
pub trait OverlayEnforcer: Send + Sync {
    fn on_blocked_state_changed(&self, blocked: bool);

    /// Whether the barrier is currently in front of the user
    fn is_showing(&self) -> bool;
}

pub trait NotificationSink: Send + Sync {
    fn show_expiration_warning(&self, remaining_minutes: i64);
}

/// Periodic hand-off of the usage snapshot to an external store
pub trait SyncHook: Send + Sync {
    fn sync(&self, snapshot: &UsageSnapshot);
}

/// Suppresses repeats of the same expiry warning within a short window
#[derive(Debug, Default)]
pub struct WarningTracker {
    last: Option<(i64, i64)>,
}

impl WarningTracker {
    /// Record and allow a warning unless this remaining value was warned about recently
    pub fn should_warn(&mut self, remaining_minutes: i64, now: i64) -> bool {
        if let Some((minutes, at)) = self.last {
            if minutes == remaining_minutes && now - at < MIN_WARNING_INTERVAL_MS {
                return false;
            }
        }
        self.last = Some((remaining_minutes, now));
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Run a desktop command off the async workers when a runtime is available
///
/// Lock and notification helpers shell out and can block for a while; the
/// state machine calls its collaborators with its state lock held.
fn run_desktop_action<F>(action: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(action);
        }
        Err(_) => action(),
    }
}

/// Uses the OS screen lock as the blocking barrier
///
/// The barrier counts as showing while the session is locked or idle, so a
/// user who unlocks during a block is locked out again on the next refresh.
/// Interactivity comes from the screen monitor's samples.
pub struct ScreenLocker {
    blocked: AtomicBool,
    screen: watch::Receiver<bool>,
}

impl ScreenLocker {
    pub fn new(screen: watch::Receiver<bool>) -> Self {
        Self {
            blocked: AtomicBool::new(false),
            screen,
        }
    }
}

impl OverlayEnforcer for ScreenLocker {
    fn on_blocked_state_changed(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);

        if blocked {
            info!("Daily screen time used up, locking screen");
            run_desktop_action(|| {
                let message = "Today's screen time has run out.";
                if let Err(e) = platform::notify("Screen time is up", message) {
                    warn!("Failed to send notification: {:#}", e);
                }
                if let Err(e) = platform::lock_screen() {
                    error!("Failed to lock screen: {:#}", e);
                }
            });
        } else {
            info!("Screen time available again, lifting block");
        }
    }

    fn is_showing(&self) -> bool {
        self.blocked.load(Ordering::SeqCst) && !*self.screen.borrow()
    }
}

/// Desktop notification for the remaining-time warning
#[derive(Debug, Default)]
pub struct DesktopNotifier;

impl NotificationSink for DesktopNotifier {
    fn show_expiration_warning(&self, remaining_minutes: i64) {
        info!("Sending {} minute warning", remaining_minutes);

        let message = format!(
            "You have {} minute{} of screen time left today. Please save your work.",
            remaining_minutes,
            if remaining_minutes == 1 { "" } else { "s" }
        );

        run_desktop_action(move || {
            if let Err(e) = platform::notify("Screen Time Warning", &message) {
                warn!("Failed to send notification: {:#}", e);
            }
        });
    }
}

/// Sync hook that only records the snapshot in the log
#[derive(Debug, Default)]
pub struct LogSync;

impl SyncHook for LogSync {
    fn sync(&self, snapshot: &UsageSnapshot) {
        info!(
            day = %snapshot.day_key,
            used = snapshot.duration,
            budget = snapshot.credit.minutes,
            blocked = snapshot.blocked,
            "Usage sync"
        );
    }
}
