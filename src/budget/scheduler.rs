use anyhow::Result;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::engine::{BlockingStateMachine, UsageSnapshot};
use crate::remote::ResponderWatchdog;

/// Pick the next local re-check interval for the given state
///
/// `None` means the budget is far enough away that the fallback tier covers it.
pub fn next_check_interval(blocked: bool, remaining_minutes: i64) -> Option<Duration> {
    if blocked {
        Some(Duration::from_secs(10 * 60))
    } else if remaining_minutes <= 1 {
        Some(Duration::from_secs(30))
    } else if remaining_minutes <= 5 {
        Some(Duration::from_secs(60))
    } else if remaining_minutes <= 15 {
        Some(Duration::from_secs(5 * 60))
    } else {
        None
    }
}

/// Coarse periodic work: re-check usage and revive the responder if needed
#[derive(Clone)]
pub struct FallbackJob {
    engine: BlockingStateMachine,
    watchdog: Option<ResponderWatchdog>,
}

impl FallbackJob {
    pub fn new(engine: BlockingStateMachine, watchdog: Option<ResponderWatchdog>) -> Self {
        Self { engine, watchdog }
    }

    /// One pass of the job; safe to run at any time and any number of times
    pub async fn run_once(&self) {
        debug!("Running fallback check");
        self.engine.refresh().await;

        if let Some(watchdog) = &self.watchdog {
            watchdog.ensure_running().await;
        }
    }
}

#[derive(Debug)]
enum SchedulerCommand {
    CheckNow,
    Stop,
}

/// Re-checks usage more often as the budget runs out
///
/// A single task owns one optional deadline, so at most one adaptive check
/// is ever pending. A coarse fallback tick runs alongside it.
pub struct AdaptiveScheduler {
    engine: BlockingStateMachine,
    fallback: FallbackJob,
    fallback_interval: Duration,
    commands: Mutex<Option<mpsc::Sender<SchedulerCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptiveScheduler {
    pub fn new(engine: BlockingStateMachine, fallback: FallbackJob, fallback_interval: Duration) -> Self {
        Self {
            engine,
            fallback,
            fallback_interval,
            commands: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the scheduler task, following `screen` for interactive-state changes
    pub async fn start(&self, screen: watch::Receiver<bool>) -> Result<()> {
        let mut commands = self.commands.lock().await;
        if commands.is_some() {
            anyhow::bail!("Scheduler is already running");
        }

        info!(
            "Starting scheduler (fallback every {} seconds)",
            self.fallback_interval.as_secs()
        );

        let (tx, rx) = mpsc::channel(8);
        *commands = Some(tx);
        drop(commands);

        self.engine.set_running(true).await;

        let task = tokio::spawn(run_scheduler(
            self.engine.clone(),
            self.fallback.clone(),
            self.fallback_interval,
            screen,
            rx,
        ));
        *self.task.lock().await = Some(task);

        Ok(())
    }

    /// Stop the scheduler task and wait for it to exit
    pub async fn stop(&self) {
        let Some(commands) = self.commands.lock().await.take() else {
            return;
        };

        info!("Stopping scheduler");
        let _ = commands.send(SchedulerCommand::Stop).await;

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }

        self.engine.set_running(false).await;
    }

    /// Request an immediate check
    pub async fn check_now(&self) {
        if let Some(commands) = self.commands.lock().await.as_ref() {
            let _ = commands.send(SchedulerCommand::CheckNow).await;
        }
    }

    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        self.commands.lock().await.is_some()
    }
}

async fn run_scheduler(
    engine: BlockingStateMachine,
    fallback: FallbackJob,
    fallback_interval: Duration,
    mut screen: watch::Receiver<bool>,
    mut commands: mpsc::Receiver<SchedulerCommand>,
) {
    let mut snapshots = engine.subscribe();
    let mut screen_on = *screen.borrow_and_update();
    let mut screen_open = true;
    let mut deadline: Option<Instant> = None;

    let mut fallback_tick = time::interval_at(Instant::now() + fallback_interval, fallback_interval);
    fallback_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if screen_on {
        spawn_check(&engine);
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SchedulerCommand::CheckNow) => spawn_check(&engine),
                Some(SchedulerCommand::Stop) | None => break,
            },
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                spawn_check(&engine);
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                deadline = reschedule(&snapshot, screen_on);
            }
            changed = screen.changed(), if screen_open => {
                if changed.is_err() {
                    debug!("Screen state source closed");
                    screen_open = false;
                    continue;
                }
                screen_on = *screen.borrow_and_update();
                if screen_on {
                    debug!("Screen became interactive, checking now");
                    spawn_check(&engine);
                } else {
                    debug!("Screen became non-interactive, pausing checks");
                    deadline = None;
                }
            }
            _ = fallback_tick.tick() => {
                let job = fallback.clone();
                tokio::spawn(async move { job.run_once().await });
            }
        }
    }

    debug!("Scheduler task exited");
}

fn spawn_check(engine: &BlockingStateMachine) {
    let engine = engine.clone();
    tokio::spawn(async move {
        engine.refresh().await;
    });
}

fn reschedule(snapshot: &UsageSnapshot, screen_on: bool) -> Option<Instant> {
    if !screen_on {
        return None;
    }

    let interval = next_check_interval(snapshot.blocked, snapshot.remaining())?;
    debug!("Next check in {} seconds", interval.as_secs());
    Some(Instant::now() + interval)
}
