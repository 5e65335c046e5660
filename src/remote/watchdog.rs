use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::responder::{DiscoveryResponder, ResponderError, ResponderStatus};

/// Keeps the discovery responder alive while discovery is enabled
#[derive(Clone)]
pub struct ResponderWatchdog {
    responder: DiscoveryResponder,
    enabled: bool,
    restart_delays: Vec<Duration>,
    restarting: Arc<AtomicBool>,
}

impl ResponderWatchdog {
    pub fn new(responder: DiscoveryResponder, enabled: bool, restart_delays: Vec<Duration>) -> Self {
        Self {
            responder,
            enabled,
            restart_delays,
            restarting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn responder(&self) -> &DiscoveryResponder {
        &self.responder
    }

    /// Start the responder if it should be running but is not
    ///
    /// Returns whether the responder is running afterwards.
    pub async fn ensure_running(&self) -> bool {
        if !self.enabled {
            return false;
        }

        if self.responder.is_running().await {
            return true;
        }

        info!("Discovery is enabled but the responder is not running, starting it");
        match self.responder.start().await {
            Ok(_) => true,
            Err(ResponderError::AlreadyRunning) => true,
            Err(e) => {
                warn!("Failed to start discovery responder: {}", e);
                false
            }
        }
    }

    /// Restart immediately, then after each configured delay until one attempt works
    ///
    /// Gives up as soon as `shutdown` turns true, including mid-delay.
    pub async fn restart_with_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.restarting.swap(true, Ordering::AcqRel) {
            debug!("Responder restart already in progress");
            return false;
        }

        let delays = std::iter::once(Duration::ZERO).chain(self.restart_delays.iter().copied());
        let mut revived = false;

        for (attempt, delay) in delays.enumerate() {
            if !delay.is_zero() {
                debug!("Next responder restart attempt in {} seconds", delay.as_secs());
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    // A dropped sender counts as shutdown too
                    _ = shutdown.wait_for(|stop| *stop) => {}
                }
            }

            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                info!("Shutdown requested, abandoning responder restart");
                break;
            }

            match self.responder.start().await {
                Ok(addr) => {
                    info!("Discovery responder restarted on {} (attempt {})", addr, attempt + 1);
                    revived = true;
                    break;
                }
                Err(ResponderError::AlreadyRunning) => {
                    revived = true;
                    break;
                }
                Err(e @ ResponderError::SecurityUnavailable(_)) => {
                    error!("Not restarting discovery responder: {}", e);
                    break;
                }
                Err(e) => warn!("Responder restart attempt {} failed: {}", attempt + 1, e),
            }
        }

        self.restarting.store(false, Ordering::Release);
        revived
    }

    /// Watch the responder status and restart it whenever it fails
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        // Subscribed before spawning so a failure reported right away is not missed
        let mut status = self.responder.status();

        tokio::spawn(async move {
            if !self.enabled {
                return;
            }

            loop {
                let failure = tokio::select! {
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        match status.borrow_and_update().clone() {
                            ResponderStatus::Failed(reason) => Some(reason),
                            _ => None,
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        None
                    }
                };

                if let Some(reason) = failure {
                    warn!("Discovery responder failed ({}), restarting", reason);
                    self.restart_with_backoff(&mut shutdown).await;
                }

                // The restart wait may already have consumed the shutdown change
                if *shutdown.borrow() {
                    break;
                }
            }

            debug!("Responder watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Credit;
    use crate::budget::testing::TestRig;
    use crate::remote::channel::SecureChannel;
    use crate::remote::protocol::CommandProcessor;
    use crate::remote::responder::ResponderSettings;
    use std::net::SocketAddr;
    use std::time::Instant;

    fn make_watchdog_on(
        rig: &TestRig,
        bind_addr: SocketAddr,
        restart_delays: Vec<Duration>,
    ) -> ResponderWatchdog {
        let responder = DiscoveryResponder::new(
            ResponderSettings {
                bind_addr,
                recv_timeout: Duration::from_millis(100),
                bind_attempts: 1,
                bind_backoff: Duration::from_millis(10),
            },
            SecureChannel::from_device_id("0123456789ABCDEF"),
            CommandProcessor::new(rig.engine.clone()),
        );

        ResponderWatchdog::new(responder, true, restart_delays)
    }

    fn make_test_watchdog(rig: &TestRig, enabled: bool) -> ResponderWatchdog {
        let mut watchdog = make_watchdog_on(
            rig,
            "127.0.0.1:0".parse().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(15)],
        );
        watchdog.enabled = enabled;
        watchdog
    }

    #[tokio::test]
    async fn test_ensure_running_revives_stopped_responder() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        let watchdog = make_test_watchdog(&rig, true);

        assert!(!watchdog.responder().is_running().await);
        assert!(watchdog.ensure_running().await);
        assert!(watchdog.responder().is_running().await);

        // Idempotent
        assert!(watchdog.ensure_running().await);

        watchdog.responder().stop().await;
    }

    #[tokio::test]
    async fn test_disabled_watchdog_does_nothing() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        let watchdog = make_test_watchdog(&rig, false);

        assert!(!watchdog.ensure_running().await);
        assert!(!watchdog.responder().is_running().await);
    }

    #[tokio::test]
    async fn test_restart_after_failure() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        let watchdog = make_test_watchdog(&rig, true);
        let responder = watchdog.responder().clone();
        responder.start().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = watchdog.clone().spawn(shutdown_rx);
        let mut status = responder.status();

        responder.simulate_failure("socket closed").await;

        let running = time::timeout(Duration::from_secs(5), async {
            loop {
                status.changed().await.unwrap();
                if matches!(*status.borrow_and_update(), ResponderStatus::Running(_)) {
                    break;
                }
            }
        })
        .await;
        assert!(running.is_ok());
        assert!(responder.is_running().await);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        responder.stop().await;
    }

    // The tests below hold the port with a socket that lacks SO_REUSEADDR,
    // which makes the responder's bind fail on Linux.

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_restart_succeeds_on_a_delayed_attempt() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        let occupied = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let watchdog = make_watchdog_on(
            &rig,
            occupied.local_addr().unwrap(),
            vec![Duration::from_millis(300)],
        );

        // Free the port after the immediate attempt has failed
        let release = tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            drop(occupied);
        });

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let started = Instant::now();
        assert!(watchdog.restart_with_backoff(&mut shutdown_rx).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(watchdog.responder().is_running().await);

        release.await.unwrap();
        watchdog.responder().stop().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_shutdown_interrupts_restart_delay() {
        let rig = TestRig::new(Credit::new(20, 1, 1));
        let occupied = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let watchdog = make_watchdog_on(
            &rig,
            occupied.local_addr().unwrap(),
            vec![Duration::from_secs(30)],
        );
        let responder = watchdog.responder().clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = watchdog.spawn(shutdown_rx);

        // The immediate restart fails and the watchdog settles into the 30 s wait
        responder.simulate_failure("socket closed").await;
        time::sleep(Duration::from_millis(200)).await;

        shutdown_tx.send(true).unwrap();
        let stopped = time::timeout(Duration::from_secs(3), task).await;
        assert!(stopped.is_ok(), "watchdog kept waiting after shutdown");

        // No restart sneaks in after shutdown
        drop(occupied);
        time::sleep(Duration::from_millis(100)).await;
        assert!(!responder.is_running().await);
    }
}
