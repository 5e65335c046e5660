use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::budget::clock::Clock;
use crate::budget::tracker::{UsageEvent, UsageEventKind, UsageEventSource};

const EVENT_LOG_VERSION: &str = "1.0";

/// Events older than this are dropped from the log
const RETENTION_MS: i64 = 48 * 60 * 60 * 1000;

/// Minimum gap between heartbeat-only writes
const HEARTBEAT_PERSIST_MS: i64 = 60 * 1000;

/// Answers whether someone is actively using the screen right now
pub trait InteractiveProbe: Send + Sync {
    fn is_interactive(&self) -> bool;
}

/// Probe backed by the desktop session manager
#[derive(Debug, Default)]
pub struct DesktopProbe;

impl InteractiveProbe for DesktopProbe {
    fn is_interactive(&self) -> bool {
        super::is_interactive()
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct EventLogFile {
    version: String,
    /// Last time the monitor confirmed the recorded state
    last_seen: i64,
    events: Vec<UsageEvent>,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<UsageEvent>,
    interactive: bool,
    last_seen: i64,
    last_persisted: i64,
}

/// Interactive-state history recorded by the screen monitor
///
/// When backed by a file, usage survives a daemon restart. An interval left
/// open by an unclean shutdown is closed at the last confirmed heartbeat.
pub struct SessionEventLog {
    path: Option<PathBuf>,
    state: Mutex<LogState>,
}

impl SessionEventLog {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = LogState::default();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read event log: {}", path.display()))?;

            match serde_json::from_str::<EventLogFile>(&content) {
                Ok(file) if file.version == EVENT_LOG_VERSION => {
                    state.events = file.events;
                    state.last_seen = file.last_seen;
                }
                Ok(file) => {
                    warn!("Event log version mismatch (got {}), starting fresh", file.version);
                }
                Err(e) => {
                    warn!("Discarding unreadable event log {}: {}", path.display(), e);
                }
            }
        }

        let dangling = state
            .events
            .last()
            .is_some_and(|e| e.kind == UsageEventKind::InteractiveStart);
        if dangling {
            let closed_at = state.last_seen.max(state.events.last().map_or(0, |e| e.timestamp));
            debug!("Closing interval left open by previous run at {}", closed_at);
            state.events.push(UsageEvent::end(closed_at));
        }

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Record the screen state observed at `at`, adding an event on transitions
    pub fn record(&self, interactive: bool, at: i64) {
        let mut state = self.lock();
        state.last_seen = at;

        if interactive == state.interactive {
            if at - state.last_persisted >= HEARTBEAT_PERSIST_MS {
                self.persist(&mut state);
            }
            return;
        }

        state.interactive = interactive;
        state.events.push(if interactive {
            UsageEvent::start(at)
        } else {
            UsageEvent::end(at)
        });
        state.events.retain(|e| at - e.timestamp <= RETENTION_MS);
        self.persist(&mut state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &mut LogState) {
        let Some(path) = &self.path else {
            return;
        };

        let file = EventLogFile {
            version: EVENT_LOG_VERSION.to_string(),
            last_seen: state.last_seen,
            events: state.events.clone(),
        };

        let result = serde_json::to_vec(&file)
            .context("Failed to serialize event log")
            .and_then(|content| super::common::atomic_write(path, &content));

        match result {
            Ok(()) => state.last_persisted = state.last_seen,
            Err(e) => warn!("Failed to persist event log: {:#}", e),
        }
    }
}

impl UsageEventSource for SessionEventLog {
    fn query_events(&self, begin: i64, end: i64) -> Result<Vec<UsageEvent>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.timestamp >= begin && e.timestamp < end)
            .copied()
            .collect())
    }

    fn is_currently_interactive(&self) -> bool {
        self.lock().interactive
    }
}

/// Polls the interactive probe, feeding the event log and a screen-state channel
pub struct ScreenStateMonitor {
    probe: Arc<dyn InteractiveProbe>,
    log: Arc<SessionEventLog>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    state: Arc<watch::Sender<bool>>,
}

impl ScreenStateMonitor {
    pub fn new(
        probe: Arc<dyn InteractiveProbe>,
        log: Arc<SessionEventLog>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(false);

        Self {
            probe,
            log,
            clock,
            poll_interval,
            state: Arc::new(state),
        }
    }

    /// Screen state updates; `true` while interactive
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Probe once, record the result and publish it if it changed
    pub async fn poll_once(&self) -> bool {
        let probe = self.probe.clone();
        let interactive = tokio::task::spawn_blocking(move || probe.is_interactive())
            .await
            .unwrap_or_else(|e| {
                warn!("Screen probe failed, assuming interactive: {}", e);
                true
            });

        self.log.record(interactive, self.clock.now_millis());

        self.state.send_if_modified(|current| {
            if *current == interactive {
                return false;
            }
            info!(
                "Screen is now {}",
                if interactive { "interactive" } else { "idle or locked" }
            );
            *current = interactive;
            true
        });

        interactive
    }

    /// Poll until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.poll_once().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Screen monitor stopped");
        })
    }
}
