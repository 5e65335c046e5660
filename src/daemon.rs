use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::budget::{
    AdaptiveScheduler, BlockingStateMachine, Clock, Collaborators, CreditStore, DesktopNotifier,
    FallbackJob, FileCreditStore, LogSync, ScreenLocker, SystemClock, UsageEventSource,
};
use crate::config::{AppConfig, DiscoveryConfig};
use crate::platform::common::ensure_directory_exists;
use crate::platform::{DesktopProbe, ScreenStateMonitor, SessionEventLog};
use crate::remote::{
    CommandProcessor, DeviceIdentity, DiscoveryResponder, ResponderSettings, ResponderWatchdog,
};

/// Files kept in the data directory
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub credits: PathBuf,
    pub identity: PathBuf,
    pub events: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            credits: data_dir.join("credits.json"),
            identity: data_dir.join("identity.json"),
            events: data_dir.join("usage-events.json"),
        }
    }
}

/// Run the enforcement daemon until Ctrl+C
pub async fn run_daemon(config: AppConfig, data_dir: PathBuf) -> Result<()> {
    info!("Starting screen-budget daemon");
    info!("Data directory: {}", data_dir.display());
    info!(
        "Default budget: {} minutes ({} five-minute and {} one-minute extensions)",
        config.budget.default_minutes,
        config.budget.default_five_extends,
        config.budget.default_one_extends
    );

    ensure_directory_exists(&data_dir)?;
    let paths = DataPaths::new(&data_dir);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = Arc::new(SessionEventLog::open(&paths.events)?);

    let monitor = Arc::new(ScreenStateMonitor::new(
        Arc::new(DesktopProbe),
        events.clone(),
        clock.clone(),
        config.scheduler.screen_poll_interval(),
    ));

    let engine = build_engine(&config, &paths, events, clock, monitor.subscribe());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog = if config.discovery.enabled {
        start_remote_control(&config.discovery, &paths, engine.clone()).await
    } else {
        info!("Discovery disabled, remote control unavailable");
        None
    };

    // Sample once so the scheduler starts from the real screen state
    monitor.poll_once().await;
    let monitor_task = monitor.clone().spawn(shutdown_rx.clone());
    let watchdog_task = watchdog.clone().map(|w| w.spawn(shutdown_rx.clone()));

    let fallback = FallbackJob::new(engine.clone(), watchdog.clone());
    let scheduler = AdaptiveScheduler::new(engine.clone(), fallback, config.scheduler.fallback_interval());
    scheduler.start(monitor.subscribe()).await?;
    // Establish the blocked state now, even if nobody is at the screen
    scheduler.check_now().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    scheduler.stop().await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = monitor_task.await {
        error!("Screen monitor ended abnormally: {}", e);
    }

    // The watchdog must be gone before the responder stops, or it could revive it
    if let Some(task) = watchdog_task {
        if let Err(e) = task.await {
            error!("Responder watchdog ended abnormally: {}", e);
        }
    }

    if let Some(watchdog) = &watchdog {
        watchdog.responder().stop().await;
    }

    let last = engine.snapshot();
    info!(
        "screen-budget daemon stopped ({} of {} minutes used on {})",
        last.duration, last.credit.minutes, last.day_key
    );
    Ok(())
}

/// State machine over the on-disk credits and usage log, enforcing on this desktop
///
/// `screen` carries the sampled interactive state the screen locker checks.
pub fn build_engine(
    config: &AppConfig,
    paths: &DataPaths,
    events: Arc<SessionEventLog>,
    clock: Arc<dyn Clock>,
    screen: watch::Receiver<bool>,
) -> BlockingStateMachine {
    let store = Arc::new(CreditStore::new(
        Box::new(FileCreditStore::new(&paths.credits)),
        config.budget.default_credit(),
    ));
    let source: Arc<dyn UsageEventSource> = events;

    BlockingStateMachine::new(
        store,
        source,
        Collaborators {
            overlay: Arc::new(ScreenLocker::new(screen)),
            notifier: Arc::new(DesktopNotifier),
            sync: Arc::new(LogSync),
            clock,
        },
        config.budget.settle_delay(),
    )
}

/// Bring up the responder; failures here disable remote control but never enforcement
async fn start_remote_control(
    config: &DiscoveryConfig,
    paths: &DataPaths,
    engine: BlockingStateMachine,
) -> Option<ResponderWatchdog> {
    let identity = match DeviceIdentity::load_or_create(&paths.identity) {
        Ok(identity) => identity,
        Err(e) => {
            error!("Device identity unavailable, remote control disabled: {:#}", e);
            return None;
        }
    };

    let channel = identity.channel();
    if let Err(e) = channel.self_test() {
        error!("Secure channel self-test failed, remote control disabled: {}", e);
        return None;
    }

    let responder = DiscoveryResponder::new(
        ResponderSettings::from(config),
        channel,
        CommandProcessor::new(engine),
    );
    let watchdog = ResponderWatchdog::new(responder, true, config.restart_delays());

    if !watchdog.ensure_running().await {
        warn!("Discovery responder not running yet, the fallback check will retry");
    }

    Some(watchdog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_paths_live_in_data_dir() {
        let paths = DataPaths::new(Path::new("/var/lib/screen-budget"));
        assert_eq!(paths.credits, Path::new("/var/lib/screen-budget/credits.json"));
        assert_eq!(paths.identity, Path::new("/var/lib/screen-budget/identity.json"));
        assert_eq!(paths.events, Path::new("/var/lib/screen-budget/usage-events.json"));
    }

    #[tokio::test]
    async fn remote_control_creates_identity() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(temp_dir.path());
        let rig = crate::budget::testing::TestRig::new(crate::budget::Credit::new(20, 1, 1));

        let config = DiscoveryConfig {
            enabled: true,
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..Default::default()
        };

        let watchdog = start_remote_control(&config, &paths, rig.engine.clone())
            .await
            .unwrap();
        assert!(paths.identity.exists());
        assert!(watchdog.responder().is_running().await);

        watchdog.responder().stop().await;
    }
}
