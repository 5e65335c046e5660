use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelError, SecureChannel};
use super::protocol::{
    CommandProcessor, DISCOVERY_RESPONSE, Inbound, MAX_DATAGRAM, RESPONSE_PREFIX,
};
use crate::config::DiscoveryConfig;

/// Hard receive errors in a row before the listener gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderStatus {
    Stopped,
    Running(SocketAddr),
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("secure channel unavailable: {0}")]
    SecurityUnavailable(#[from] ChannelError),

    #[error("failed to bind {addr} after {attempts} attempts: {source}")]
    Bind {
        addr: SocketAddr,
        attempts: u32,
        source: io::Error,
    },

    #[error("responder is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct ResponderSettings {
    pub bind_addr: SocketAddr,
    pub recv_timeout: Duration,
    pub bind_attempts: u32,
    pub bind_backoff: Duration,
}

impl From<&DiscoveryConfig> for ResponderSettings {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            bind_addr: SocketAddr::new(config.bind_address, config.port),
            recv_timeout: Duration::from_millis(config.recv_timeout_ms),
            bind_attempts: config.bind_attempts,
            bind_backoff: Duration::from_millis(config.bind_backoff_ms),
        }
    }
}

struct Listener {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// UDP listener answering discovery probes and encrypted commands
#[derive(Clone)]
pub struct DiscoveryResponder {
    settings: ResponderSettings,
    channel: SecureChannel,
    processor: CommandProcessor,
    status: Arc<watch::Sender<ResponderStatus>>,
    listener: Arc<Mutex<Option<Listener>>>,
}

impl DiscoveryResponder {
    pub fn new(settings: ResponderSettings, channel: SecureChannel, processor: CommandProcessor) -> Self {
        let (status, _) = watch::channel(ResponderStatus::Stopped);

        Self {
            settings,
            channel,
            processor,
            status: Arc::new(status),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Verify the cipher, bind the socket and spawn the receive loop
    pub async fn start(&self) -> Result<SocketAddr, ResponderError> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|l| !l.task.is_finished()) {
            return Err(ResponderError::AlreadyRunning);
        }

        if let Err(e) = self.channel.self_test() {
            error!("Secure channel self-test failed, remote control disabled: {}", e);
            return Err(e.into());
        }

        let socket = bind_with_retry(&self.settings).await?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| ResponderError::Bind {
                addr: self.settings.bind_addr,
                attempts: 1,
                source,
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listen(
            socket,
            self.channel.clone(),
            self.processor.clone(),
            self.settings.recv_timeout,
            shutdown_rx,
            self.status.clone(),
        ));

        info!("Discovery responder listening on {}", local_addr);
        self.status.send_replace(ResponderStatus::Running(local_addr));

        *listener = Some(Listener {
            shutdown: shutdown_tx,
            task,
        });

        Ok(local_addr)
    }

    /// Signal the receive loop to exit and wait for the socket to close
    pub async fn stop(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };

        info!("Stopping discovery responder");
        let _ = listener.shutdown.send(true);

        if let Err(e) = listener.task.await {
            error!("Discovery responder task ended abnormally: {}", e);
        }

        self.status.send_replace(ResponderStatus::Stopped);
    }

    pub async fn is_running(&self) -> bool {
        self.listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    pub fn status(&self) -> watch::Receiver<ResponderStatus> {
        self.status.subscribe()
    }

    /// Tear the listener down the way a fatal receive error would
    #[cfg(test)]
    pub(crate) async fn simulate_failure(&self, reason: &str) {
        if let Some(listener) = self.listener.lock().await.take() {
            let _ = listener.shutdown.send(true);
            let _ = listener.task.await;
        }
        self.status.send_replace(ResponderStatus::Failed(reason.to_string()));
    }
}

async fn bind_with_retry(settings: &ResponderSettings) -> Result<UdpSocket, ResponderError> {
    let attempts = settings.bind_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match bind_socket(settings.bind_addr) {
            Ok(socket) => return Ok(socket),
            Err(e) if attempt < attempts => {
                let backoff = settings.bind_backoff * attempt;
                warn!(
                    "Failed to bind {} (attempt {}/{}): {}",
                    settings.bind_addr, attempt, attempts, e
                );
                debug!("Retrying bind in {} ms", backoff.as_millis());
                time::sleep(backoff).await;
            }
            Err(source) => {
                return Err(ResponderError::Bind {
                    addr: settings.bind_addr,
                    attempts,
                    source,
                });
            }
        }
    }
}

/// Broadcast-capable UDP socket that can rebind a port still held by a closing socket
#[cfg(unix)]
fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    use nix::sys::socket::{
        AddressFamily, SockFlag, SockType, SockaddrStorage, bind, setsockopt, socket, sockopt,
    };
    use std::os::fd::AsRawFd;

    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    let fd = socket(family, SockType::Datagram, SockFlag::empty(), None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    setsockopt(&fd, sockopt::Broadcast, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;

    let socket = std::net::UdpSocket::from(fd);
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(not(unix))]
fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

async fn listen(
    socket: UdpSocket,
    channel: SecureChannel,
    processor: CommandProcessor,
    recv_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
    status: Arc<watch::Sender<ResponderStatus>>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut consecutive_errors = 0;

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = time::timeout(recv_timeout, socket.recv_from(&mut buf)) => received,
        };

        match received {
            // Timed out: nothing to do but look at the shutdown flag again
            Err(_) => continue,
            Ok(Ok((len, sender))) => {
                consecutive_errors = 0;
                let message = String::from_utf8_lossy(&buf[..len]).into_owned();
                handle_datagram(&message, sender, &channel, &processor).await;
            }
            Ok(Err(e)) => {
                consecutive_errors += 1;
                warn!("Error receiving datagram ({} in a row): {}", consecutive_errors, e);

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("Discovery responder giving up after repeated receive errors");
                    status.send_replace(ResponderStatus::Failed(e.to_string()));
                    return;
                }
            }
        }
    }

    debug!("Discovery responder loop exited");
}

async fn handle_datagram(
    message: &str,
    sender: SocketAddr,
    channel: &SecureChannel,
    processor: &CommandProcessor,
) {
    match Inbound::classify(message) {
        Inbound::Discovery => {
            debug!("Discovery request from {}", sender);
            send_reply(DISCOVERY_RESPONSE, sender).await;
        }
        Inbound::Command(envelope) => match channel.decrypt(envelope) {
            Ok(command) => {
                let reply = processor.process(&command).await;
                let envelope = channel.encrypt(&reply);
                send_reply(&format!("{}{}", RESPONSE_PREFIX, envelope), sender).await;
            }
            Err(e) => {
                warn!("Dropping undecryptable command from {}: {}", sender, e);
            }
        },
        Inbound::Ignored => {
            debug!("Ignoring {} byte datagram from {}", message.len(), sender);
        }
    }
}

/// Replies leave from a fresh ephemeral socket, not the listening one
async fn send_reply(reply: &str, to: SocketAddr) {
    let local: SocketAddr = if to.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let result = async {
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(reply.as_bytes(), to).await
    }
    .await;

    if let Err(e) = result {
        warn!("Failed to send reply to {}: {}", to, e);
    }
}
