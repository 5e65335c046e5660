//! In-memory collaborators shared by the unit tests

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::clock::{Clock, day_key_in, day_start_in};
use super::credit::{Credit, CreditPersistence, CreditStore};
use super::engine::{BlockingStateMachine, Collaborators, UsageSnapshot};
use super::enforcement::{NotificationSink, OverlayEnforcer, SyncHook};
use super::tracker::{UsageEvent, UsageEventSource};

/// 2025-03-14T00:00:00Z
pub const TEST_DAY_START: i64 = 1_741_910_400_000;
pub const MINUTE_MS: i64 = 60_000;

/// Clock in UTC that only moves when told to
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn day_start_millis(&self, now: i64) -> i64 {
        day_start_in(&Utc, now)
    }

    fn day_key(&self, now: i64) -> String {
        day_key_in(&Utc, now)
    }
}

#[derive(Clone, Default)]
pub struct ScriptedEvents {
    events: Arc<Mutex<Vec<UsageEvent>>>,
    interactive: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
    queries: Arc<AtomicUsize>,
}

impl ScriptedEvents {
    /// Number of history queries made so far, one per refresh
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn push(&self, event: UsageEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn set_interactive(&self, interactive: bool) {
        self.interactive.store(interactive, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

impl UsageEventSource for ScriptedEvents {
    fn query_events(&self, begin: i64, end: i64) -> Result<Vec<UsageEvent>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("usage history unavailable");
        }

        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.timestamp >= begin && e.timestamp < end)
            .copied()
            .collect())
    }

    fn is_currently_interactive(&self) -> bool {
        self.interactive.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct MemoryCreditStore {
    records: Arc<Mutex<HashMap<String, Credit>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryCreditStore {
    pub fn fail_writes(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, day_key: &str) -> Option<Credit> {
        self.records.lock().unwrap().get(day_key).copied()
    }
}

impl CreditPersistence for MemoryCreditStore {
    fn load(&self, day_key: &str) -> Result<Option<Credit>> {
        Ok(self.get(day_key))
    }

    fn store(&self, day_key: &str, credit: &Credit) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.records.lock().unwrap().insert(day_key.to_string(), *credit);
        Ok(())
    }
}

pub struct RecordingOverlay {
    changes: Mutex<Vec<bool>>,
    showing: AtomicBool,
}

impl Default for RecordingOverlay {
    fn default() -> Self {
        Self {
            changes: Mutex::new(Vec::new()),
            showing: AtomicBool::new(true),
        }
    }
}

impl RecordingOverlay {
    pub fn changes(&self) -> Vec<bool> {
        self.changes.lock().unwrap().clone()
    }

    pub fn set_showing(&self, showing: bool) {
        self.showing.store(showing, Ordering::SeqCst);
    }
}

impl OverlayEnforcer for RecordingOverlay {
    fn on_blocked_state_changed(&self, blocked: bool) {
        self.changes.lock().unwrap().push(blocked);
    }

    fn is_showing(&self) -> bool {
        self.showing.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    warnings: Mutex<Vec<i64>>,
}

impl RecordingNotifier {
    pub fn warnings(&self) -> Vec<i64> {
        self.warnings.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn show_expiration_warning(&self, remaining_minutes: i64) {
        self.warnings.lock().unwrap().push(remaining_minutes);
    }
}

#[derive(Default)]
pub struct RecordingSync {
    count: AtomicUsize,
}

impl RecordingSync {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl SyncHook for RecordingSync {
    fn sync(&self, _snapshot: &UsageSnapshot) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A state machine wired to fakes, with usage continuously interactive since midnight
pub struct TestRig {
    pub engine: BlockingStateMachine,
    pub clock: ManualClock,
    pub events: ScriptedEvents,
    pub backend: MemoryCreditStore,
    pub store: Arc<CreditStore>,
    pub overlay: Arc<RecordingOverlay>,
    pub notifier: Arc<RecordingNotifier>,
    pub sync: Arc<RecordingSync>,
}

impl TestRig {
    pub fn new(credit: Credit) -> Self {
        let clock = ManualClock::new(TEST_DAY_START);
        let events = ScriptedEvents::default();
        events.push(UsageEvent::start(TEST_DAY_START));
        events.set_interactive(true);

        let backend = MemoryCreditStore::default();
        let store = Arc::new(CreditStore::new(Box::new(backend.clone()), credit));
        let overlay = Arc::new(RecordingOverlay::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let sync = Arc::new(RecordingSync::default());

        let engine = BlockingStateMachine::new(
            store.clone(),
            Arc::new(events.clone()),
            Collaborators {
                overlay: overlay.clone(),
                notifier: notifier.clone(),
                sync: sync.clone(),
                clock: Arc::new(clock.clone()),
            },
            Duration::from_millis(500),
        );

        Self {
            engine,
            clock,
            events,
            backend,
            store,
            overlay,
            notifier,
            sync,
        }
    }

    /// Move the clock so today's usage is exactly `minutes`
    pub fn set_usage_minutes(&self, minutes: i64) {
        self.clock.set(TEST_DAY_START + minutes * MINUTE_MS);
    }

    /// Jump to one minute past the next midnight with the screen still on
    pub fn start_next_day(&self) {
        self.clock.set(TEST_DAY_START + 24 * 60 * MINUTE_MS + MINUTE_MS);
    }

    pub fn day_key(&self) -> String {
        self.clock.day_key(self.clock.now_millis())
    }

    pub fn stored_credit(&self) -> Option<Credit> {
        self.backend.get(&self.day_key())
    }
}
