use super::discover::Discovery;
use super::wire::MultipartCodec;
use crate::error::{EventLogError, Result};
use crate::message::ClusterMessage;
use crate::metrics::PipelineMetrics;
use bytes::Bytes;
use futures_util::SinkExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const FANOUT_BUFFER: usize = 4096;
const CONTROL_BUFFER: usize = 1;

/// Outbound peer link. A single worker takes store messages and cluster
/// control messages and fans every frame out to each connected peer.
pub struct PubSocket {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    control_tx: mpsc::Sender<ClusterMessage>,
    control_rx: Mutex<Option<mpsc::Receiver<ClusterMessage>>>,
    frames: broadcast::Sender<Vec<Bytes>>,
    metrics: PipelineMetrics,
    token: CancellationToken,
}

impl PubSocket {
    pub async fn bind(
        addr: &str,
        metrics: PipelineMetrics,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            EventLogError::Internal(format!("failed to bind pub socket {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (frames, _) = broadcast::channel(FANOUT_BUFFER);
        tracing::info!("Pub socket listening on {}", local_addr);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            frames,
            metrics,
            token: parent.child_token(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of peers currently attached.
    pub fn peer_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Sender for cluster control messages such as the `monitor` heartbeat.
    pub fn control(&self) -> mpsc::Sender<ClusterMessage> {
        self.control_tx.clone()
    }

    pub fn run(
        &self,
        mut messages: mpsc::Receiver<ClusterMessage>,
        tracker: &TaskTracker,
    ) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| EventLogError::Internal("pub socket already running".to_string()))?;
        let mut control = self
            .control_rx
            .lock()
            .take()
            .ok_or_else(|| EventLogError::Internal("pub socket already running".to_string()))?;

        let frames = self.frames.clone();
        let metrics = self.metrics.clone();
        let token = self.token.clone();
        tracker.spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    Some(message) = messages.recv() => message,
                    Some(message) = control.recv() => message,
                    else => break,
                };
                metrics
                    .cluster_frames
                    .with_label_values(&["out", message.mode.as_str()])
                    .inc();
                // no connected peers is not an error
                let _ = frames.send(message.into_parts());
            }
            tracing::debug!("Pub worker stopped");
        });

        let frames = self.frames.clone();
        let token = self.token.clone();
        let conn_tracker = tracker.clone();
        tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!("Peer {} subscribed", peer);
                        let rx = frames.subscribe();
                        conn_tracker.spawn(serve_peer(stream, peer, rx, token.clone()));
                    }
                    Err(e) => {
                        tracing::error!("Pub socket accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(())
    }

    /// Deregisters this instance so peers drop their links, then closes the
    /// socket.
    pub async fn stop(&self, discovery: &Discovery) {
        if let Err(e) = discovery.stop().await {
            tracing::warn!("Failed to deregister instance: {}", e);
        }
        self.token.cancel();
        tracing::info!("Pub socket closed");
    }
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    mut frames: broadcast::Receiver<Vec<Bytes>>,
    token: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let mut sink = FramedWrite::new(stream, MultipartCodec);
    loop {
        let parts = tokio::select! {
            _ = token.cancelled() => break,
            parts = frames.recv() => parts,
        };
        match parts {
            Ok(parts) => {
                if let Err(e) = sink.send(parts).await {
                    tracing::info!("Peer {} went away: {}", peer, e);
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Peer {} lagged, {} frames skipped", peer, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
