use super::discover::{Discovery, MembershipEvent};
use super::distribution::Distribution;
use super::instance::Instance;
use super::wire::MultipartCodec;
use crate::error::{EventLogError, Result};
use crate::message::{ClusterMode, MonitorData};
use crate::metrics::PipelineMetrics;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy)]
pub struct SubTimings {
    pub connect_timeout: Duration,
    pub retry: Duration,
    pub health: Duration,
}

/// Inbound peer links: one listener task per discovered peer, each with its
/// own cancellation token.
pub struct SubManager {
    discovery: Arc<Discovery>,
    distribution: Arc<Distribution>,
    sub_input: mpsc::Sender<Vec<Bytes>>,
    metrics: PipelineMetrics,
    timings: SubTimings,
    clients: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl SubManager {
    pub fn new(
        discovery: Arc<Discovery>,
        distribution: Arc<Distribution>,
        sub_input: mpsc::Sender<Vec<Bytes>>,
        metrics: PipelineMetrics,
        timings: SubTimings,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            discovery,
            distribution,
            sub_input,
            metrics,
            timings,
            clients: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            token: parent.child_token(),
        }
    }

    pub fn run(self: &Arc<Self>, tracker: &TaskTracker) {
        let mut events = self.discovery.subscribe();
        for instance in self.discovery.others() {
            self.add(&instance);
        }

        let manager = self.clone();
        tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = manager.token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(MembershipEvent::Added(instance)) => manager.add(&instance),
                    Ok(MembershipEvent::Removed(instance)) => manager.remove(&instance),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} membership events, reconciling", skipped);
                        manager.reconcile();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let manager = self.clone();
        tracker.spawn(async move {
            let period = manager.timings.health;
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = manager.token.cancelled() => break,
                    _ = ticker.tick() => manager.reconcile(),
                }
            }
        });
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.clients.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn add(self: &Arc<Self>, instance: &Instance) {
        let addr = instance.pub_addr();
        let token = {
            let mut clients = self.clients.lock();
            if clients.contains_key(&addr) {
                return;
            }
            let token = self.token.child_token();
            clients.insert(addr.clone(), token.clone());
            token
        };

        tracing::info!("Subscribing to peer {} at {}", instance.host_id, addr);
        let manager = self.clone();
        self.tracker.spawn(async move { manager.listen(addr, token).await });
    }

    fn remove(&self, instance: &Instance) {
        let addr = instance.pub_addr();
        if let Some(token) = self.clients.lock().remove(&addr) {
            tracing::info!("Unsubscribing from peer {} at {}", instance.host_id, addr);
            token.cancel();
        }
    }

    /// Starts listeners for known peers that lack one and stops listeners of
    /// peers that are gone.
    fn reconcile(self: &Arc<Self>) {
        let others = self.discovery.others();
        let known: Vec<String> = others.iter().map(Instance::pub_addr).collect();
        self.clients.lock().retain(|addr, token| {
            let keep = known.contains(addr);
            if !keep {
                token.cancel();
            }
            keep
        });
        for instance in &others {
            self.add(instance);
        }
    }

    /// Connect, read until the link drops, wait, repeat.
    async fn listen(self: Arc<Self>, addr: String, token: CancellationToken) {
        loop {
            let connect = tokio::time::timeout(self.timings.connect_timeout, TcpStream::connect(&addr));
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = connect => result,
            };

            match result {
                Ok(Ok(stream)) => {
                    tracing::info!("Connected to peer {}", addr);
                    self.read_frames(&addr, stream, &token).await;
                }
                Ok(Err(e)) => tracing::warn!("Connect to peer {} failed: {}", addr, e),
                Err(_) => tracing::warn!("Connect to peer {} timed out", addr),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.timings.retry) => {}
            }
        }
        tracing::debug!("Listener for peer {} stopped", addr);
    }

    async fn read_frames(&self, addr: &str, stream: TcpStream, token: &CancellationToken) {
        let mut frames = FramedRead::new(stream, MultipartCodec);
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(parts)) => {
                    if let Err(e) = self.dispatch_frame(parts) {
                        tracing::error!("Dropping frame from peer {}: {}", addr, e);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Link to peer {} broken: {}", addr, e);
                    return;
                }
                None => {
                    tracing::info!("Peer {} closed the link", addr);
                    return;
                }
            }
        }
    }

    /// Routes one `[topic, payload]` frame received from a peer.
    pub fn dispatch_frame(&self, parts: Vec<Bytes>) -> Result<()> {
        if parts.len() != 2 {
            return Err(EventLogError::Protocol(format!(
                "expected 2 frame parts, got {}",
                parts.len()
            )));
        }

        let mode = ClusterMode::from_topic(&parts[0]).ok_or_else(|| {
            EventLogError::Protocol(format!(
                "unknown topic {}",
                String::from_utf8_lossy(&parts[0])
            ))
        })?;
        self.metrics
            .cluster_frames
            .with_label_values(&["in", mode.as_str()])
            .inc();

        match mode {
            ClusterMode::Monitor => {
                let data: MonitorData = std::str::from_utf8(&parts[1])
                    .map_err(|e| EventLogError::InvalidMessage(format!("monitor data: {}", e)))?
                    .parse()?;
                self.distribution.update(data);
                Ok(())
            }
            ClusterMode::EventLog | ClusterMode::MonitorMessage | ClusterMode::NewMonitorMessage => {
                match self.sub_input.try_send(parts) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.metrics.dropped("sub", "full");
                        Err(EventLogError::ChannelClosed(
                            "sub input channel is full".to_string(),
                        ))
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(EventLogError::ChannelClosed(
                        "sub input channel".to_string(),
                    )),
                }
            }
        }
    }

    pub async fn stop(&self) {
        self.token.cancel();
        self.clients.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Sub manager stopped");
    }
}
