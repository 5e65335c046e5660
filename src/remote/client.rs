use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::channel::SecureChannel;
use super::protocol::{
    COMMAND_PREFIX, Command, DISCOVERY_REQUEST, DISCOVERY_RESPONSE, MAX_DATAGRAM, RESPONSE_PREFIX,
    Response,
};

/// Parent side of the discovery and command exchange
pub struct ParentClient {
    socket: UdpSocket,
}

impl ParentClient {
    pub async fn new() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind client socket")?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on client socket")?;

        Ok(Self { socket })
    }

    /// Broadcast a discovery probe on the local network
    pub async fn discover(&self, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>> {
        self.discover_at(SocketAddr::from((Ipv4Addr::BROADCAST, port)), timeout)
            .await
    }

    /// Send a discovery probe to `target` and collect every device that answers before `timeout`
    pub async fn discover_at(&self, target: SocketAddr, timeout: Duration) -> Result<Vec<SocketAddr>> {
        self.socket
            .send_to(DISCOVERY_REQUEST.as_bytes(), target)
            .await
            .with_context(|| format!("Failed to send discovery probe to {}", target))?;

        let deadline = Instant::now() + timeout;
        let mut found = BTreeSet::new();

        while let Some((reply, sender)) = self.recv_until(deadline).await? {
            if reply.trim() == DISCOVERY_RESPONSE {
                debug!("Device answered from {}", sender);
                found.insert(sender);
            }
        }

        Ok(found.into_iter().collect())
    }

    /// Encrypt a command for `device_id`, send it and wait for the decrypted reply
    pub async fn send_command(
        &self,
        target: SocketAddr,
        device_id: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<Response> {
        let channel = SecureChannel::from_device_id(device_id);
        let request = format!("{}{}", COMMAND_PREFIX, channel.encrypt(&command.to_string()));

        self.socket
            .send_to(request.as_bytes(), target)
            .await
            .with_context(|| format!("Failed to send command to {}", target))?;

        let deadline = Instant::now() + timeout;
        while let Some((reply, sender)) = self.recv_until(deadline).await? {
            let Some(envelope) = reply.trim().strip_prefix(RESPONSE_PREFIX) else {
                debug!("Ignoring unrelated datagram from {}", sender);
                continue;
            };

            let text = match channel.decrypt(envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not decrypt reply from {}: {}", sender, e);
                    continue;
                }
            };

            return Response::parse(&text).map_err(Into::into);
        }

        anyhow::bail!(
            "No reply from {} within {} ms (check the device id and that discovery is enabled)",
            target,
            timeout.as_millis()
        )
    }

    async fn recv_until(&self, deadline: Instant) -> Result<Option<(String, SocketAddr)>> {
        let mut buf = [0u8; MAX_DATAGRAM];

        match time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok((len, sender))) => {
                Ok(Some((String::from_utf8_lossy(&buf[..len]).into_owned(), sender)))
            }
            Ok(Err(e)) => Err(e).context("Failed to receive reply"),
        }
    }
}
