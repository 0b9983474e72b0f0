//! Store manager
//!
//! Owns one barrel table per message kind, the input channels ingress and
//! peers write into, the barrel-event worker pools, the GC timer and the
//! channel of messages leaving this instance for the pub socket.
//!
//! Locally ingested operation events go to three places: the event store
//! (persisted), the read store (live relay, `progress` included) and the pub
//! socket. Peer frames arrive on the sub input and only reach the relay
//! stores, so nothing a peer sent is ever published again.

pub mod docker;
pub mod event;
pub mod garbage;
pub mod monitor;
pub mod read;
pub mod shard;
pub mod table;

pub use docker::DockerLogStore;
pub use event::EventStore;
pub use garbage::{GarbageQueue, GarbageWorker};
pub use monitor::MonitorStore;
pub use read::ReadStore;
pub use shard::ShardRouter;
pub use table::BarrelTable;

use crate::barrel::{FlushOutcome, SharedMessage};
use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::error::{EventLogError, Result};
use crate::message::{
    ClusterMessage, ClusterMode, EventLogMessage, MonitorData, MonitorReport,
    decode_legacy_monitor,
};
use crate::metrics::PipelineMetrics;
use crate::persistence::{DockerLogPersister, EventFilePersister, MessagePersister};
use crate::status::StatusSink;
use bytes::Bytes;
use chrono::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Collaborators every per-kind store shares.
#[derive(Clone)]
pub struct StoreContext {
    pub clock: SharedClock,
    pub metrics: PipelineMetrics,
    pub garbage: GarbageQueue,
}

/// Accounts for a flush and routes failed batches to the garbage queue.
pub(crate) fn record_flush(ctx: &StoreContext, store: &str, outcome: FlushOutcome) {
    match outcome {
        FlushOutcome::Empty => {}
        FlushOutcome::Persisted(_) => {
            ctx.metrics
                .store_flush
                .with_label_values(&[store, "ok"])
                .inc();
        }
        FlushOutcome::Failed { error, messages } => {
            tracing::error!(
                "{} store failed to persist {} messages: {}",
                store,
                messages.len(),
                error
            );
            ctx.metrics
                .store_flush
                .with_label_values(&[store, "error"])
                .inc();
            ctx.metrics
                .store_dropped
                .with_label_values(&[store, "persistence"])
                .inc_by(messages.len() as u64);
            ctx.garbage.push(messages);
        }
    }
}

/// Write ends of the per-kind input channels.
#[derive(Clone)]
pub struct StoreInputs {
    /// Operation event JSON from the RPC listener.
    pub event: mpsc::Sender<Bytes>,
    /// Container-log frame payloads.
    pub docker: mpsc::Sender<Bytes>,
    /// Legacy monitor JSON.
    pub monitor: mpsc::Sender<Bytes>,
    /// New monitor reports.
    pub new_monitor: mpsc::Sender<Bytes>,
    /// `[topic, payload]` frames received from peers.
    pub sub: mpsc::Sender<Vec<Bytes>>,
}

struct InputReceivers {
    event: mpsc::Receiver<Bytes>,
    docker: mpsc::Receiver<Bytes>,
    monitor: mpsc::Receiver<Bytes>,
    new_monitor: mpsc::Receiver<Bytes>,
    sub: mpsc::Receiver<Vec<Bytes>>,
}

enum PeerItem {
    Event(SharedMessage),
    Relay(SharedMessage),
    Report(MonitorReport),
}

/// The per-kind stores plus the outbound publish channel.
pub struct Stores {
    pub event: Arc<EventStore>,
    pub docker: Arc<DockerLogStore>,
    /// Live relay of operation events.
    pub read: ReadStore,
    /// Relay of legacy monitor messages.
    pub monitor_relay: ReadStore,
    pub monitor: MonitorStore,
    metrics: PipelineMetrics,
    publish: mpsc::Sender<ClusterMessage>,
}

impl Stores {
    fn publish(&self, mode: ClusterMode, data: Bytes) {
        match self.publish.try_send(ClusterMessage::new(mode, data)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Publish channel full, dropping {} message", mode);
                self.metrics.dropped("publish", "full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Publish channel closed, dropping {} message", mode);
            }
        }
    }

    fn handle_local_event(&self, message: SharedMessage) {
        if let Err(e) = self.read.insert(message.clone()) {
            tracing::debug!("Read relay rejected message: {}", e);
        }
        if let Err(e) = self.event.insert(message.clone()) {
            tracing::debug!("Event store rejected message: {}", e);
        }
        self.publish(ClusterMode::EventLog, message.content.clone());
    }

    fn handle_docker(&self, message: SharedMessage) {
        if let Err(e) = self.docker.insert(message) {
            tracing::debug!("Container log store rejected message: {}", e);
        }
    }

    fn handle_local_monitor(&self, message: SharedMessage) {
        let raw = message.content.clone();
        match self.monitor_relay.insert(message) {
            Ok(()) => self.publish(ClusterMode::MonitorMessage, raw),
            Err(e) => tracing::debug!("Monitor relay rejected message: {}", e),
        }
    }

    fn handle_local_report(&self, report: MonitorReport, raw: Bytes) {
        match self.monitor.insert(report) {
            Ok(_) => self.publish(ClusterMode::NewMonitorMessage, raw),
            Err(e) => tracing::warn!("Failed to merge monitor report: {}", e),
        }
    }

    fn handle_peer(&self, item: PeerItem) {
        let result = match item {
            PeerItem::Event(message) => self.read.insert(message),
            PeerItem::Relay(message) => self.monitor_relay.insert(message),
            PeerItem::Report(report) => self.monitor.insert(report).map(|_| ()),
        };
        if let Err(e) = result {
            tracing::debug!("Dropping peer message: {}", e);
        }
    }

    /// Runs every store's GC and restarts the load window.
    pub async fn gc(&self) {
        self.event.gc().await;
        self.docker.gc().await;
        self.read.gc();
        self.monitor_relay.gc();
        self.monitor.gc();
        self.event.reset_window();
        self.docker.reset_window();
    }
}

pub fn relay_idle() -> Duration {
    Duration::minutes(2)
}

pub struct StoreManager {
    config: StoreConfig,
    stores: Arc<Stores>,
    inputs: StoreInputs,
    metrics: PipelineMetrics,
    receivers: Mutex<Option<InputReceivers>>,
    publish_rx: Mutex<Option<mpsc::Receiver<ClusterMessage>>>,
    garbage_worker: Mutex<Option<GarbageWorker>>,
    garbage_token: CancellationToken,
    garbage_handle: Mutex<Option<JoinHandle<()>>>,
    token: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl StoreManager {
    /// Builds the stores with the file persistence plugins rooted at
    /// `store.db.home_path`.
    pub fn new(
        config: &StoreConfig,
        clock: SharedClock,
        metrics: PipelineMetrics,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let home = &config.db.home_path;
        let event_persister: Arc<dyn MessagePersister> =
            Arc::new(EventFilePersister::new(home, clock.clone())?);
        let docker_persister: Arc<dyn MessagePersister> =
            Arc::new(DockerLogPersister::new(home, clock.clone())?);
        Ok(Self::with_persisters(
            config,
            clock,
            metrics,
            status,
            event_persister,
            docker_persister,
        ))
    }

    pub fn with_persisters(
        config: &StoreConfig,
        clock: SharedClock,
        metrics: PipelineMetrics,
        status: Arc<dyn StatusSink>,
        event_persister: Arc<dyn MessagePersister>,
        docker_persister: Arc<dyn MessagePersister>,
    ) -> Self {
        let capacity = config.channel_capacity;
        let garbage_token = CancellationToken::new();
        let (garbage, garbage_worker) = GarbageQueue::new(
            config.garbage_message_file.clone(),
            config.garbage_flush_interval(),
            capacity,
            garbage_token.clone(),
        );
        let ctx = StoreContext {
            clock,
            metrics: metrics.clone(),
            garbage,
        };

        let (publish, publish_rx) = mpsc::channel(capacity);
        let stores = Stores {
            event: Arc::new(EventStore::new(
                ctx.clone(),
                config.peer_event_max_log_number,
                config.peer_event_max_cache_log_number,
                capacity,
                event_persister,
                status,
            )),
            docker: Arc::new(DockerLogStore::new(
                ctx.clone(),
                config.peer_docker_max_cache_log_number,
                config.subscriber_capacity,
                capacity,
                docker_persister,
            )),
            read: ReadStore::new(
                "read",
                ctx.clone(),
                config.peer_event_max_cache_log_number,
                config.subscriber_capacity,
                relay_idle(),
                false,
            ),
            monitor_relay: ReadStore::new(
                "monitor",
                ctx.clone(),
                0,
                config.subscriber_capacity,
                relay_idle(),
                true,
            ),
            monitor: MonitorStore::new(ctx, config.subscriber_capacity),
            metrics: metrics.clone(),
            publish,
        };

        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (docker_tx, docker_rx) = mpsc::channel(capacity);
        let (monitor_tx, monitor_rx) = mpsc::channel(capacity);
        let (new_monitor_tx, new_monitor_rx) = mpsc::channel(capacity);
        let (sub_tx, sub_rx) = mpsc::channel(capacity);

        Self {
            config: config.clone(),
            stores: Arc::new(stores),
            inputs: StoreInputs {
                event: event_tx,
                docker: docker_tx,
                monitor: monitor_tx,
                new_monitor: new_monitor_tx,
                sub: sub_tx,
            },
            metrics,
            receivers: Mutex::new(Some(InputReceivers {
                event: event_rx,
                docker: docker_rx,
                monitor: monitor_rx,
                new_monitor: new_monitor_rx,
                sub: sub_rx,
            })),
            publish_rx: Mutex::new(Some(publish_rx)),
            garbage_worker: Mutex::new(Some(garbage_worker)),
            garbage_token,
            garbage_handle: Mutex::new(None),
            token: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn inputs(&self) -> StoreInputs {
        self.inputs.clone()
    }

    pub fn stores(&self) -> &Arc<Stores> {
        &self.stores
    }

    /// Hands the outbound channel to the pub socket. Only the first caller
    /// gets it.
    pub fn take_publish_receiver(&self) -> Option<mpsc::Receiver<ClusterMessage>> {
        self.publish_rx.lock().take()
    }

    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| EventLogError::Internal("store manager already started".to_string()))?;
        let token = parent.child_token();
        *self.token.lock() = Some(token.clone());

        if let Some(worker) = self.garbage_worker.lock().take() {
            *self.garbage_handle.lock() = Some(tokio::spawn(worker.run()));
        }

        let config = &self.config;
        let capacity = config.channel_capacity;
        let tracker = &self.tracker;

        self.stores
            .event
            .spawn_workers(config.handle_message_core_number, tracker, &token);
        self.stores
            .docker
            .spawn_workers(config.handle_docker_log_core_number, tracker, &token);

        let stores = self.stores.clone();
        let event_router = ShardRouter::spawn(
            "event",
            config.handle_message_core_number,
            capacity,
            tracker,
            &token,
            move |message: SharedMessage| stores.handle_local_event(message),
        );
        self.spawn_decoder("event", receivers.event, event_router, &token, |raw| {
            let message = EventLogMessage::decode_event(raw)?;
            Ok((message.event_id.clone(), Arc::new(message)))
        });

        let stores = self.stores.clone();
        let docker_router = ShardRouter::spawn(
            "docker",
            config.handle_docker_log_core_number,
            capacity,
            tracker,
            &token,
            move |message: SharedMessage| stores.handle_docker(message),
        );
        self.spawn_decoder("docker", receivers.docker, docker_router, &token, |raw| {
            let message = EventLogMessage::decode_container_log(raw)?;
            Ok((message.event_id.clone(), Arc::new(message)))
        });

        let stores = self.stores.clone();
        let monitor_router = ShardRouter::spawn(
            "monitor",
            config.handle_monitor_message_core_number,
            capacity,
            tracker,
            &token,
            move |message: SharedMessage| stores.handle_local_monitor(message),
        );
        self.spawn_decoder("monitor", receivers.monitor, monitor_router, &token, |raw| {
            let message = decode_legacy_monitor(raw)?;
            Ok((message.event_id.clone(), Arc::new(message)))
        });

        let stores = self.stores.clone();
        let report_router = ShardRouter::spawn(
            "new_monitor",
            config.handle_monitor_message_core_number,
            capacity,
            tracker,
            &token,
            move |(report, raw): (MonitorReport, Bytes)| stores.handle_local_report(report, raw),
        );
        self.spawn_decoder(
            "new_monitor",
            receivers.new_monitor,
            report_router,
            &token,
            |raw| {
                let report = MonitorReport::decode(&raw)?;
                Ok((report.service_id.clone(), (report, raw)))
            },
        );

        let stores = self.stores.clone();
        let peer_router = ShardRouter::spawn(
            "peer",
            config.handle_sub_message_core_number,
            capacity,
            tracker,
            &token,
            move |item: PeerItem| stores.handle_peer(item),
        );
        self.spawn_decoder("peer", receivers.sub, peer_router, &token, decode_peer_frame);

        let stores = self.stores.clone();
        let gc_token = token.clone();
        let period = config.gc_interval();
        tracker.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = gc_token.cancelled() => break,
                    _ = ticker.tick() => stores.gc().await,
                }
            }
        });

        tracing::info!("Store manager started");
        Ok(())
    }

    /// One decoder task per input keeps arrival order; decoded items are
    /// sharded by id so a producer always lands on the same worker.
    fn spawn_decoder<I, T, F>(
        &self,
        name: &'static str,
        mut rx: mpsc::Receiver<I>,
        router: ShardRouter<T>,
        token: &CancellationToken,
        decode: F,
    ) where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Result<(String, T)> + Send + 'static,
    {
        let metrics = self.metrics.clone();
        let token = token.clone();
        self.tracker.spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = token.cancelled() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                };
                match decode(raw) {
                    Ok((key, item)) => {
                        if !router.route(&key, item).await {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Dropping malformed {} message: {}", name, e);
                        metrics.dropped(name, "decode");
                    }
                }
            }
            tracing::debug!("{} decoder stopped", name);
        });
    }

    /// Sum of the event and container-log stores' load, stamped with
    /// `instance_id`.
    pub fn monitor_data(&self, instance_id: &str) -> MonitorData {
        let (event_size, event_logs) = self.stores.event.monitor_counts();
        let (docker_size, docker_logs) = self.stores.docker.monitor_counts();
        MonitorData {
            instance_id: instance_id.to_string(),
            service_size: event_size + docker_size,
            log_size_per_minute: event_logs + docker_logs,
        }
    }

    /// Stops the workers, flushes every barrel, then drains the garbage
    /// queue.
    pub async fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;

        self.stores.event.flush_all().await;
        self.stores.docker.flush_all().await;

        self.garbage_token.cancel();
        let handle = self.garbage_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Garbage worker failed: {}", e);
            }
        }
        tracing::info!("Store manager stopped");
    }
}

fn decode_peer_frame(parts: Vec<Bytes>) -> Result<(String, PeerItem)> {
    let [topic, payload]: [Bytes; 2] = parts.try_into().map_err(|parts: Vec<Bytes>| {
        EventLogError::Protocol(format!("expected 2 frame parts, got {}", parts.len()))
    })?;

    match ClusterMode::from_topic(&topic) {
        Some(ClusterMode::EventLog) => {
            let message = EventLogMessage::decode_event(payload)?;
            Ok((message.event_id.clone(), PeerItem::Event(Arc::new(message))))
        }
        Some(ClusterMode::MonitorMessage) => {
            let message = decode_legacy_monitor(payload)?;
            Ok((message.event_id.clone(), PeerItem::Relay(Arc::new(message))))
        }
        Some(ClusterMode::NewMonitorMessage) => {
            let report = MonitorReport::decode(&payload)?;
            Ok((report.service_id.clone(), PeerItem::Report(report)))
        }
        Some(ClusterMode::Monitor) | None => Err(EventLogError::Protocol(format!(
            "unexpected topic {}",
            String::from_utf8_lossy(&topic)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::status::LogStatusSink;
    use chrono::Utc;

    fn config(home: &std::path::Path) -> StoreConfig {
        let mut config = StoreConfig::default();
        config.db.home_path = home.to_path_buf();
        config.garbage_message_file = home.join("garbage.log");
        config.peer_event_max_cache_log_number = 2;
        config
    }

    fn manager(home: &std::path::Path) -> StoreManager {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        StoreManager::new(
            &config(home),
            clock,
            PipelineMetrics::unregistered().unwrap(),
            Arc::new(LogStatusSink),
        )
        .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_local_event_is_stored_relayed_and_published() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(temp_dir.path());
        let mut published = manager.take_publish_receiver().unwrap();
        let token = CancellationToken::new();
        manager.start(&token).unwrap();

        let raw = Bytes::from_static(
            br#"{"event_id":"abc","step":"info","status":"","message":"hello","level":"info","time":""}"#,
        );
        manager.inputs().event.send(raw.clone()).await.unwrap();

        let frame = published.recv().await.unwrap();
        assert_eq!(frame.mode, ClusterMode::EventLog);
        assert_eq!(frame.data, raw);

        let stores = manager.stores().clone();
        assert!(eventually(|| stores.event.len() == 1 && stores.read.len() == 1).await);
        assert_eq!(manager.monitor_data("me").service_size, 1);

        manager.stop().await;
        let content =
            std::fs::read_to_string(temp_dir.path().join("eventlog").join("abc.log")).unwrap();
        assert!(content.ends_with(" hello\n"));
    }

    struct FailingPersister;

    #[async_trait::async_trait]
    impl MessagePersister for FailingPersister {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn save(&self, _id: &str, _messages: &[Arc<EventLogMessage>]) -> Result<()> {
            Err(EventLogError::Internal("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_flush_goes_to_garbage_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let metrics = PipelineMetrics::unregistered().unwrap();
        let manager = StoreManager::with_persisters(
            &config(temp_dir.path()),
            Arc::new(ManualClock::new(Utc::now())),
            metrics.clone(),
            Arc::new(LogStatusSink),
            Arc::new(FailingPersister),
            Arc::new(FailingPersister),
        );
        let token = CancellationToken::new();
        manager.start(&token).unwrap();

        let raw = Bytes::from_static(
            br#"{"event_id":"abc","step":"build","status":"","message":"lost line","level":"info","time":"2024-01-01T00:00:00Z"}"#,
        );
        manager.inputs().event.send(raw).await.unwrap();
        let stores = manager.stores().clone();
        assert!(eventually(|| stores.event.len() == 1).await);

        manager.stop().await;

        let content = std::fs::read_to_string(temp_dir.path().join("garbage.log")).unwrap();
        assert_eq!(content, "(build-info) 2024-01-01T00:00:00Z: lost line\n");
        assert!(!temp_dir.path().join("eventlog").join("abc.log").exists());
        let failed = metrics
            .store_flush
            .with_label_values(&["event", "error"])
            .get();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_peer_event_is_relayed_but_not_published() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(temp_dir.path());
        let mut published = manager.take_publish_receiver().unwrap();
        let token = CancellationToken::new();
        manager.start(&token).unwrap();

        let mut sub = manager.stores().read.subscribe("peer-event", "ws");
        let frame = vec![
            Bytes::from_static(b"event_log"),
            Bytes::from_static(br#"{"event_id":"peer-event","step":"progress","message":"50%"}"#),
        ];
        manager.inputs().sub.send(frame).await.unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.message, "50%");
        assert!(manager.stores().event.is_empty());
        assert!(published.try_recv().is_err());

        manager.stop().await;
    }

    #[test]
    fn test_peer_frame_validation() {
        assert!(decode_peer_frame(vec![Bytes::from_static(b"event_log")]).is_err());
        assert!(
            decode_peer_frame(vec![Bytes::from_static(b"bogus"), Bytes::from_static(b"{}")])
                .is_err()
        );
        assert!(
            decode_peer_frame(vec![Bytes::from_static(b"monitor"), Bytes::from_static(b"a,1,2")])
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(temp_dir.path());
        let token = CancellationToken::new();
        manager.start(&token).unwrap();
        assert!(manager.start(&token).is_err());
        manager.stop().await;
    }
}
