use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::credit::{Credit, CreditStore};
use super::enforcement::{NotificationSink, OverlayEnforcer, SyncHook, WarningTracker};
use super::tracker::{EventAccumulator, UsageEventSource};

const MILLIS_PER_MINUTE: i64 = 60_000;

/// How often usage is handed to the sync hook when nothing else changes
pub const SYNC_INTERVAL_MS: i64 = 5 * MILLIS_PER_MINUTE;

/// Observable blocking state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockingState {
    pub blocked: bool,
    /// Today's interactive usage in whole minutes
    pub duration: i64,
    pub running: bool,
}

/// Point-in-time view published to schedulers and status readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub blocked: bool,
    pub duration: i64,
    pub running: bool,
    pub credit: Credit,
    pub day_key: String,
}

impl UsageSnapshot {
    pub fn remaining(&self) -> i64 {
        self.credit.remaining(self.duration)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("an extension is already in progress")]
    InProgress,

    #[error("no extensions left for today")]
    NoExtensionsAvailable,
}

/// Outcome of a successful extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    pub granted_minutes: i64,
    pub credit: Credit,
}

/// Held for the lifetime of one extension, including its settle re-check
pub struct ExtensionPermit {
    flag: Arc<AtomicBool>,
}

impl Drop for ExtensionPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// External collaborators the state machine drives
#[derive(Clone)]
pub struct Collaborators {
    pub overlay: Arc<dyn OverlayEnforcer>,
    pub notifier: Arc<dyn NotificationSink>,
    pub sync: Arc<dyn SyncHook>,
    pub clock: Arc<dyn Clock>,
}

struct CachedCredit {
    day_key: String,
    credit: Credit,
}

struct EngineState {
    blocking: BlockingState,
    accumulator: EventAccumulator,
    credit: Option<CachedCredit>,
    warnings: WarningTracker,
    last_sync: Option<i64>,
}

struct Measurement {
    now: i64,
    day_key: String,
    usage: i64,
}

/// Owns today's usage, credit and blocked flag
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct BlockingStateMachine {
    state: Arc<Mutex<EngineState>>,
    store: Arc<CreditStore>,
    credit_stale: Arc<AtomicBool>,
    extension_in_progress: Arc<AtomicBool>,
    collaborators: Collaborators,
    settle_delay: Duration,
    snapshots: Arc<watch::Sender<UsageSnapshot>>,
}

impl BlockingStateMachine {
    pub fn new(
        store: Arc<CreditStore>,
        source: Arc<dyn UsageEventSource>,
        collaborators: Collaborators,
        settle_delay: Duration,
    ) -> Self {
        let credit_stale = Arc::new(AtomicBool::new(true));
        let stale = credit_stale.clone();
        store.subscribe(move |_, _| stale.store(true, Ordering::Release));

        let (snapshots, _) = watch::channel(UsageSnapshot {
            blocked: false,
            duration: 0,
            running: false,
            credit: store.default_credit(),
            day_key: String::new(),
        });

        Self {
            state: Arc::new(Mutex::new(EngineState {
                blocking: BlockingState::default(),
                accumulator: EventAccumulator::new(source),
                credit: None,
                warnings: WarningTracker::default(),
                last_sync: None,
            })),
            store,
            credit_stale,
            extension_in_progress: Arc::new(AtomicBool::new(false)),
            collaborators,
            settle_delay,
            snapshots: Arc::new(snapshots),
        }
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<UsageSnapshot> {
        self.snapshots.subscribe()
    }

    /// Most recently published snapshot
    pub fn snapshot(&self) -> UsageSnapshot {
        self.snapshots.borrow().clone()
    }

    #[cfg(test)]
    pub async fn state(&self) -> BlockingState {
        self.state.lock().await.blocking
    }

    pub async fn set_running(&self, running: bool) {
        let mut state = self.state.lock().await;
        state.blocking.running = running;
        let credit = state.credit.as_ref().map(|c| c.credit).unwrap_or(self.store.default_credit());
        let day_key = state.credit.as_ref().map(|c| c.day_key.clone()).unwrap_or_default();
        self.publish(&state, credit, day_key);
    }

    /// Recompute usage and blocking, then notify collaborators of what changed
    pub async fn refresh(&self) -> UsageSnapshot {
        let mut state = self.state.lock().await;
        let measured = self.measure(&mut state);
        let credit = self.credit_for(&mut state, &measured.day_key);

        let should_block = measured.usage >= credit.minutes;
        let changed = should_block != state.blocking.blocked;
        state.blocking.blocked = should_block;
        state.blocking.duration = measured.usage;

        let overlay = &self.collaborators.overlay;
        if changed {
            info!(
                "Blocked state changed to {} (used {} of {} minutes)",
                should_block, measured.usage, credit.minutes
            );
            overlay.on_blocked_state_changed(should_block);
        } else if should_block && !overlay.is_showing() {
            warn!("Block is active but not showing, re-asserting");
            overlay.on_blocked_state_changed(true);
        }

        if !should_block && credit.expires_soon(measured.usage) {
            let remaining = credit.remaining(measured.usage);
            if state.warnings.should_warn(remaining, measured.now) {
                self.collaborators.notifier.show_expiration_warning(remaining);
            }
        }

        let snapshot = self.publish(&state, credit, measured.day_key);

        let sync_due = state
            .last_sync
            .is_none_or(|last| measured.now - last >= SYNC_INTERVAL_MS);
        if sync_due || changed {
            self.collaborators.sync.sync(&snapshot);
            state.last_sync = Some(measured.now);
        }

        debug!(
            "Refreshed: used {} of {} minutes, blocked={}",
            snapshot.duration, snapshot.credit.minutes, snapshot.blocked
        );
        snapshot
    }

    /// Set today's budget to current usage plus `minutes`
    pub async fn direct_extension(&self, minutes: u32) -> Result<Extension, ExtensionError> {
        let permit = self.begin_extension()?;

        let extension = self
            .extend(|credit, usage| {
                credit.minutes = usage + i64::from(minutes);
                Ok(i64::from(minutes))
            })
            .await?;

        info!("Extended today's budget by {} minutes", minutes);
        self.schedule_settle(permit);
        Ok(extension)
    }

    /// Spend one unit from the extension pools
    ///
    /// A request under five minutes takes a 1-minute unit when one is left;
    /// otherwise a 5-minute unit is used. The grant is decided by which pool
    /// has units, not by `requested`.
    pub async fn credit_extension(&self, requested: u32) -> Result<Extension, ExtensionError> {
        let permit = self.begin_extension()?;

        let extension = self
            .extend(|credit, usage| {
                let granted = if requested < 5 && credit.one_extends > 0 {
                    credit.one_extends -= 1;
                    1
                } else if credit.five_extends > 0 {
                    credit.five_extends -= 1;
                    5
                } else {
                    return Err(ExtensionError::NoExtensionsAvailable);
                };
                credit.minutes = usage + granted;
                Ok(granted)
            })
            .await?;

        info!(
            "Granted {} minute extension (requested {})",
            extension.granted_minutes, requested
        );
        self.schedule_settle(permit);
        Ok(extension)
    }

    /// Lower today's budget below current usage so the device blocks
    ///
    /// The budget is never raised and recorded usage is left untouched.
    pub async fn force_lock(&self) -> Result<UsageSnapshot> {
        {
            let mut state = self.state.lock().await;
            let measured = self.measure(&mut state);
            let credit = self.credit_for(&mut state, &measured.day_key);
            let capped = credit.capped_at((measured.usage - 1).max(0));

            info!(
                "Force lock: budget {} -> {} minutes at {} minutes used",
                credit.minutes, capped.minutes, measured.usage
            );
            self.remember_credit(&mut state, &measured.day_key, capped);
        }

        let snapshot = self.refresh().await;
        if !snapshot.blocked {
            anyhow::bail!("Device did not enter the blocked state");
        }

        Ok(snapshot)
    }

    fn begin_extension(&self) -> Result<ExtensionPermit, ExtensionError> {
        self.extension_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ExtensionError::InProgress)?;

        Ok(ExtensionPermit {
            flag: self.extension_in_progress.clone(),
        })
    }

    async fn extend<F>(&self, grant: F) -> Result<Extension, ExtensionError>
    where
        F: FnOnce(&mut Credit, i64) -> Result<i64, ExtensionError>,
    {
        let mut state = self.state.lock().await;
        let measured = self.measure(&mut state);
        let mut credit = self.credit_for(&mut state, &measured.day_key);

        let granted_minutes = grant(&mut credit, measured.usage)?;
        self.remember_credit(&mut state, &measured.day_key, credit);

        let blocked = measured.usage >= credit.minutes;
        let was_blocked = state.blocking.blocked;
        state.blocking.blocked = blocked;
        state.blocking.duration = measured.usage;
        state.warnings.reset();

        if was_blocked != blocked {
            self.collaborators.overlay.on_blocked_state_changed(blocked);
        }

        self.publish(&state, credit, measured.day_key);

        Ok(Extension {
            granted_minutes,
            credit,
        })
    }

    /// Re-verify after the settle delay, then release the extension guard
    fn schedule_settle(&self, permit: ExtensionPermit) {
        let engine = self.clone();
        let delay = self.settle_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.refresh().await;
            drop(permit);
        });
    }

    fn measure(&self, state: &mut EngineState) -> Measurement {
        let clock = &self.collaborators.clock;
        let now = clock.now_millis();
        let usage_ms = state.accumulator.update(clock.day_start_millis(now), now);

        Measurement {
            now,
            day_key: clock.day_key(now),
            usage: usage_ms / MILLIS_PER_MINUTE,
        }
    }

    fn credit_for(&self, state: &mut EngineState, day_key: &str) -> Credit {
        let external = self.store.changed_externally();
        let stale = self.credit_stale.swap(false, Ordering::AcqRel) || external;

        match &state.credit {
            Some(cached) if !stale && cached.day_key == day_key => cached.credit,
            _ => {
                let credit = self.store.get(day_key);
                state.credit = Some(CachedCredit {
                    day_key: day_key.to_string(),
                    credit,
                });
                credit
            }
        }
    }

    /// Keep `credit` effective in memory even when persisting it fails
    fn remember_credit(&self, state: &mut EngineState, day_key: &str, credit: Credit) {
        self.store.save(day_key, &credit);
        self.credit_stale.store(false, Ordering::Release);
        state.credit = Some(CachedCredit {
            day_key: day_key.to_string(),
            credit,
        });
    }

    fn publish(&self, state: &EngineState, credit: Credit, day_key: String) -> UsageSnapshot {
        let snapshot = UsageSnapshot {
            blocked: state.blocking.blocked,
            duration: state.blocking.duration,
            running: state.blocking.running,
            credit,
            day_key,
        };
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }
}
