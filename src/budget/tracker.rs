use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventKind {
    InteractiveStart,
    InteractiveEnd,
}

/// A screen-state transition at an epoch-millisecond timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageEvent {
    pub timestamp: i64,
    pub kind: UsageEventKind,
}

impl UsageEvent {
    pub fn start(timestamp: i64) -> Self {
        Self {
            timestamp,
            kind: UsageEventKind::InteractiveStart,
        }
    }

    pub fn end(timestamp: i64) -> Self {
        Self {
            timestamp,
            kind: UsageEventKind::InteractiveEnd,
        }
    }
}

/// Provider of interactive-state history
pub trait UsageEventSource: Send + Sync {
    /// Events with `begin <= timestamp < end`, in timestamp order
    fn query_events(&self, begin: i64, end: i64) -> Result<Vec<UsageEvent>>;

    fn is_currently_interactive(&self) -> bool;
}

/// Running tally of today's interactive time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageEventTracker {
    /// Number of interactive intervals started today
    pub count: u32,
    /// Start of the open interval, if one is being tracked
    pub cur_start_time: Option<i64>,
    /// Committed milliseconds of closed intervals
    pub duration: i64,
    /// Upper bound of the events already replayed
    pub end_step_time_stamp: i64,
    pub last_event_time: i64,
}

impl UsageEventTracker {
    pub fn anchored_at(day_start: i64) -> Self {
        Self {
            end_step_time_stamp: day_start,
            ..Default::default()
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.cur_start_time.is_some()
    }

    fn start_interval(&mut self, at: i64) {
        if !self.is_tracking() {
            self.count += 1;
        }
        self.commit(at);
        self.cur_start_time = Some(at);
        self.last_event_time = at;
    }

    fn commit(&mut self, at: i64) {
        if let Some(start) = self.cur_start_time.take() {
            self.duration += (at - start).max(0);
        }
    }

    fn apply(&mut self, event: &UsageEvent) {
        match event.kind {
            UsageEventKind::InteractiveStart => self.start_interval(event.timestamp),
            UsageEventKind::InteractiveEnd => self.commit(event.timestamp),
        }
    }

    /// Committed time plus the open interval up to `now`
    pub fn total_at(&self, now: i64) -> i64 {
        match self.cur_start_time {
            Some(start) => self.duration + (now - start).max(0),
            None => self.duration,
        }
    }
}

/// Incrementally replays usage events into today's interactive total
pub struct EventAccumulator {
    source: Arc<dyn UsageEventSource>,
    tracker: UsageEventTracker,
}

impl EventAccumulator {
    pub fn new(source: Arc<dyn UsageEventSource>) -> Self {
        Self {
            source,
            tracker: UsageEventTracker::default(),
        }
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &UsageEventTracker {
        &self.tracker
    }

    /// Bring the tally up to `now` and return today's interactive milliseconds
    pub fn update(&mut self, day_start: i64, now: i64) -> i64 {
        if day_start > self.tracker.end_step_time_stamp {
            debug!("Starting a fresh usage tally for day beginning at {}", day_start);
            self.tracker = UsageEventTracker::anchored_at(day_start);
        }

        let mut replayed = true;
        match self.source.query_events(self.tracker.end_step_time_stamp, now) {
            Ok(events) => {
                for event in &events {
                    self.tracker.apply(event);
                }
            }
            Err(e) => {
                warn!("Failed to query usage events, keeping previous tally: {:#}", e);
                replayed = false;
            }
        }

        let interactive = self.source.is_currently_interactive();
        if interactive && !self.tracker.is_tracking() {
            self.tracker.start_interval(now);
        } else if !interactive && self.tracker.is_tracking() {
            self.tracker.commit(now);
        }

        let total = self.tracker.total_at(now);
        if replayed {
            self.tracker.end_step_time_stamp = now;
        }

        debug!(
            intervals = self.tracker.count,
            last_event = self.tracker.last_event_time,
            total_ms = total,
            "Usage tally updated"
        );
        total
    }
}
