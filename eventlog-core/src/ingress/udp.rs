use super::push;
use crate::error::{EventLogError, Result};
use crate::metrics::PipelineMetrics;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const MAX_DATAGRAM: usize = 65535;
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// One message per datagram.
pub struct DatagramServer {
    name: &'static str,
    socket: UdpSocket,
}

impl DatagramServer {
    pub async fn bind(name: &'static str, addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            EventLogError::Internal(format!("failed to bind {} udp server {}: {}", name, addr, e))
        })?;
        Ok(Self { name, socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn run(
        self,
        tx: mpsc::Sender<Bytes>,
        metrics: PipelineMetrics,
        tracker: &TaskTracker,
        token: CancellationToken,
    ) {
        tracker.spawn(async move {
            tracing::info!(
                "{} udp server listening on {:?}",
                self.name,
                self.socket.local_addr()
            );
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = self.socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, _peer)) => {
                        // the receive buffer is reused, so the payload gets its own copy
                        push(self.name, &tx, Bytes::copy_from_slice(&buf[..len]), &metrics);
                    }
                    Err(e) => {
                        tracing::error!("{} udp server read failed: {}", self.name, e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        });
    }
}
