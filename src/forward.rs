use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::shutdown::{cancellable, catch_panic, WorkerExit};
use crate::snapshot::SharedSnapshot;
use crate::ticker::Ticker;

/// Datagram body. The derived value is deliberately not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForwardPayload {
    pub counter: i64,
    pub random: f64,
}

impl ForwardPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.random.is_finite() {
            return Err(BridgeError::Send(format!(
                "random {} has no JSON encoding",
                self.random
            )));
        }
        Ok(serde_json::to_vec(self)?)
    }
}

/// Pushes `{counter, random}` from the snapshot to a fixed UDP destination,
/// fire and forget.
pub struct ForwardWorker {
    destination: String,
    snapshot: Arc<SharedSnapshot>,
    interval: Duration,
}

impl ForwardWorker {
    pub fn new(destination: impl Into<String>, snapshot: Arc<SharedSnapshot>, interval: Duration) -> Self {
        Self {
            destination: destination.into(),
            snapshot,
            interval,
        }
    }

    pub async fn run(self, token: CancellationToken) -> WorkerExit {
        let outcome = catch_panic(self.forward(&token)).await;

        match outcome {
            Ok(()) | Err(BridgeError::Cancelled) => {
                tracing::info!(worker = "forward", "stopped");
                WorkerExit::Cancelled
            }
            Err(e) => {
                tracing::error!(worker = "forward", error = %e, "forward loop terminated");
                WorkerExit::Failed(e)
            }
        }
    }

    async fn forward(&self, token: &CancellationToken) -> Result<()> {
        let destination = self.resolve_destination(token).await?;
        let bind: SocketAddr = if destination.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        tracing::info!(worker = "forward", %destination, interval = ?self.interval, "forwarding");

        let result = self.send_loop(&socket, destination, token).await;
        drop(socket);
        tracing::debug!(worker = "forward", "socket closed");
        result
    }

    async fn send_loop(
        &self,
        socket: &UdpSocket,
        destination: SocketAddr,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = Ticker::new(self.interval);
        while ticker.tick(token).await {
            let (counter, random) = self.snapshot.read_counts();
            let datagram = match (ForwardPayload { counter, random }).encode() {
                Ok(datagram) => datagram,
                Err(e) => {
                    tracing::warn!(worker = "forward", error = %e, "datagram skipped");
                    continue;
                }
            };
            if let Err(e) = cancellable(token, socket.send_to(&datagram, destination)).await? {
                tracing::warn!(worker = "forward", %destination, error = %e, "send failed");
            }
        }
        Ok(())
    }

    async fn resolve_destination(&self, token: &CancellationToken) -> Result<SocketAddr> {
        let mut addrs = cancellable(token, tokio::net::lookup_host(self.destination.as_str()))
            .await?
            .map_err(|e| BridgeError::Send(format!("resolve {}: {e}", self.destination)))?;
        addrs
            .next()
            .ok_or_else(|| BridgeError::Send(format!("{} resolved to no address", self.destination)))
    }
}
