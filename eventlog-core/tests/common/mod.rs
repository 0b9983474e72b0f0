#![allow(dead_code)]

use eventlog_core::config::RegistryBackend;
use eventlog_core::{
    Cluster, ClusterDeps, EventLogConfig, IngressServers, MemoryRegistry, PipelineMetrics,
    SharedClock, StatusSink, SubscriptionHub,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "/eventlog-it";

/// Records every status notification.
#[derive(Default)]
pub struct RecordingStatus {
    pub callbacks: Mutex<Vec<(String, String, String)>>,
}

impl StatusSink for RecordingStatus {
    fn on_callback(&self, event_id: &str, status: &str, message: &str) {
        self.callbacks.lock().push((
            event_id.to_string(),
            status.to_string(),
            message.to_string(),
        ));
    }

    fn on_code_version(&self, _event_id: &str, _message: &str) {}
}

pub struct Node {
    pub cluster: Arc<Cluster>,
    pub ingress: IngressServers,
    pub metrics: PipelineMetrics,
    pub hub: SubscriptionHub,
    home: TempDir,
}

impl Node {
    pub fn home(&self) -> PathBuf {
        self.home.path().to_path_buf()
    }

    pub async fn stop(&self) {
        self.ingress.stop().await;
        self.cluster.stop().await;
    }
}

pub fn node_config(instance_id: &str, home: &std::path::Path) -> EventLogConfig {
    let mut config = EventLogConfig::default();
    config.cluster.instance_id = Some(instance_id.to_string());
    config.cluster.host_ip = Some("127.0.0.1".to_string());
    config.cluster.pub_bind_ip = "127.0.0.1".to_string();
    config.cluster.pub_bind_port = 0;
    config.cluster.discover_home = NAMESPACE.to_string();
    config.cluster.registry.backend = RegistryBackend::Memory;
    config.cluster.monitor_tick_secs = 1;
    config.cluster.peer_retry_secs = 1;
    config.store.db.home_path = home.to_path_buf();
    config.store.garbage_message_file = home.join("garbage.log");
    config.entry.event_log_server.bind_ip = "127.0.0.1".to_string();
    config.entry.event_log_server.bind_port = 0;
    config.entry.docker_log_server.bind_ip = "127.0.0.1".to_string();
    config.entry.docker_log_server.bind_port = 0;
    config.entry.new_monitor_message_server.bind_ip = "127.0.0.1".to_string();
    config.entry.new_monitor_message_server.bind_port = 0;
    config
}

pub async fn start_node(
    instance_id: &str,
    registry: &MemoryRegistry,
    clock: SharedClock,
    status: Arc<dyn StatusSink>,
) -> Node {
    let home = tempfile::tempdir().unwrap();
    let config = node_config(instance_id, home.path());
    let metrics = PipelineMetrics::unregistered().unwrap();
    let root = CancellationToken::new();

    let cluster = Cluster::start(
        Arc::new(config.clone()),
        ClusterDeps {
            registry: Arc::new(registry.clone()),
            clock,
            metrics: metrics.clone(),
            status,
        },
        &root,
    )
    .await
    .unwrap();
    let ingress = IngressServers::start(
        &config.entry,
        cluster.store().inputs(),
        metrics.clone(),
        &root,
        cluster.fatal_sender(),
    )
    .await
    .unwrap();
    let hub = SubscriptionHub::new(cluster.store().stores().clone());

    Node {
        cluster: Arc::new(cluster),
        ingress,
        metrics,
        hub,
        home,
    }
}

/// Polls `check` every 10ms for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
