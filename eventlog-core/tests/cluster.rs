mod common;

use bytes::Bytes;
use chrono::Utc;
use common::{eventually, start_node};
use eventlog_core::cluster::{MembershipEvent, instance_key};
use eventlog_core::registry::WatchEvent;
use eventlog_core::{
    Cluster, ClusterDeps, Discovery, Distribution, Instance, InstanceStatus, LogStatusSink,
    ManualClock, MemoryRegistry, MonitorData, PipelineMetrics, Registry, SubscriptionKind,
    system_clock,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[tokio::test]
async fn test_peer_events_are_not_echoed() {
    let registry = MemoryRegistry::new(common::NAMESPACE);
    let i1 = start_node("i1", &registry, system_clock(), Arc::new(LogStatusSink)).await;
    let i2 = start_node("i2", &registry, system_clock(), Arc::new(LogStatusSink)).await;

    assert!(
        eventually(|| {
            i1.cluster.pub_socket().peer_count() == 1 && i2.cluster.pub_socket().peer_count() == 1
        })
        .await
    );

    let mut local_sub = i1.hub.subscribe(SubscriptionKind::Event, "abc", "ws-1").unwrap();
    let mut remote_sub = i2.hub.subscribe(SubscriptionKind::Event, "abc", "ws-2").unwrap();

    let raw = serde_json::to_vec(&serde_json::json!({
        "event_id": "abc",
        "step": "info",
        "message": "hello",
        "level": "info",
    }))
    .unwrap();
    i1.cluster
        .store()
        .inputs()
        .event
        .send(Bytes::from(raw))
        .await
        .unwrap();

    let remote = tokio::time::timeout(Duration::from_secs(5), remote_sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.message, "hello");
    let local = tokio::time::timeout(Duration::from_secs(5), local_sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.message, "hello");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(local_sub.try_recv().is_none());
    assert!(remote_sub.try_recv().is_none());

    let out = |node: &common::Node| {
        node.metrics
            .cluster_frames
            .with_label_values(&["out", "event_log"])
            .get()
    };
    assert_eq!(out(&i1), 1);
    assert_eq!(out(&i2), 0);
    assert_eq!(
        i2.metrics
            .cluster_frames
            .with_label_values(&["in", "event_log"])
            .get(),
        1
    );
    // peer frames land in the relay store only
    assert!(i2.cluster.store().stores().event.get("abc").is_none());

    i2.stop().await;
    i1.stop().await;
}

#[tokio::test]
async fn test_stopped_node_leaves_peer_set() {
    let registry = MemoryRegistry::new(common::NAMESPACE);
    let i1 = start_node("i1", &registry, system_clock(), Arc::new(LogStatusSink)).await;
    let i2 = start_node("i2", &registry, system_clock(), Arc::new(LogStatusSink)).await;

    assert!(eventually(|| i1.cluster.sub_manager().peers().len() == 1).await);
    assert_eq!(i1.cluster.discovery().others()[0].host_id, "i2");

    i2.stop().await;
    assert!(eventually(|| i1.cluster.discovery().others().is_empty()).await);
    assert!(eventually(|| i1.cluster.sub_manager().peers().is_empty()).await);

    i1.stop().await;
}

fn instance(id: &str, port: u16) -> Instance {
    Instance {
        host_id: id.to_string(),
        host_ip: "127.0.0.1".to_string(),
        pub_port: port,
        web_port: 0,
        docker_log_port: 0,
        host_name: id.to_string(),
        status: InstanceStatus::Create,
        tag_number: 0,
    }
}

fn load(id: &str, service_size: u64) -> MonitorData {
    MonitorData {
        instance_id: id.to_string(),
        service_size,
        log_size_per_minute: 0,
    }
}

#[tokio::test]
async fn test_silent_instance_is_evicted_by_quorum() {
    let registry = MemoryRegistry::new(common::NAMESPACE);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    registry
        .put(
            &instance_key("127.0.0.1", 9),
            &instance("silent", 9).encode().unwrap(),
        )
        .await
        .unwrap();

    let mut nodes = Vec::new();
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        let discovery = Arc::new(Discovery::new(
            Arc::new(registry.clone()),
            instance(id, 10 + i as u16),
        ));
        let membership = discovery.subscribe();
        discovery.start(&tracker, &token).await.unwrap();
        let distribution = Distribution::new(
            discovery.clone(),
            Arc::new(registry.clone()),
            clock.clone(),
            Duration::from_secs(10),
        );
        nodes.push((discovery, distribution, membership));
    }
    for (discovery, _, _) in &nodes {
        assert!(eventually(|| discovery.others().len() == 3).await);
    }

    // the silent instance is the least loaded, so it owns new producers
    for (_, distribution, _) in &nodes {
        distribution.update(load("silent", 0));
        for id in ["a", "b", "c"] {
            distribution.update(load(id, 5));
        }
    }
    assert_eq!(
        nodes[0].1.get_suitable_instance("svc-1").await.unwrap(),
        "silent"
    );

    clock.advance(chrono::Duration::seconds(11));
    for (_, distribution, _) in &nodes {
        for id in ["a", "b", "c"] {
            distribution.update(load(id, 5));
        }
    }

    nodes[0].1.check_health().await;
    assert!(nodes[0].1.is_abnormal("silent"));
    nodes[1].1.check_health().await;
    assert!(nodes[1].1.is_abnormal("silent"));
    assert!(
        registry
            .get(&instance_key("127.0.0.1", 9))
            .await
            .unwrap()
            .is_some()
    );
    nodes[2].1.check_health().await;
    assert!(
        registry
            .get(&instance_key("127.0.0.1", 9))
            .await
            .unwrap()
            .is_none()
    );

    for (discovery, distribution, membership) in &mut nodes {
        assert!(eventually(|| discovery.get_instance("silent").is_none()).await);
        let removed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match membership.recv().await.unwrap() {
                    MembershipEvent::Removed(instance) => return instance,
                    MembershipEvent::Added(_) => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(removed.host_id, "silent");
        assert_ne!(
            distribution.get_suitable_instance("svc-2").await.unwrap(),
            "silent"
        );
    }

    token.cancel();
}

/// Captures the event file's content at the moment the instance record is
/// deleted.
struct RecordingRegistry {
    inner: MemoryRegistry,
    event_file: PathBuf,
    file_at_delete: Mutex<Option<String>>,
}

#[async_trait::async_trait]
impl Registry for RecordingRegistry {
    async fn get(&self, key: &str) -> eventlog_core::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> eventlog_core::Result<Vec<(String, Vec<u8>)>> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> eventlog_core::Result<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> eventlog_core::Result<bool> {
        if key.starts_with("instance/") {
            let content = std::fs::read_to_string(&self.event_file).unwrap_or_default();
            *self.file_at_delete.lock() = Some(content);
        }
        self.inner.delete(key).await
    }

    async fn watch_prefix(&self, prefix: &str) -> eventlog_core::Result<mpsc::Receiver<WatchEvent>> {
        self.inner.watch_prefix(prefix).await
    }
}

#[tokio::test]
async fn test_stop_flushes_before_deregistering() {
    let home = tempfile::tempdir().unwrap();
    let config = common::node_config("i1", home.path());
    let registry = Arc::new(RecordingRegistry {
        inner: MemoryRegistry::new(common::NAMESPACE),
        event_file: home.path().join("eventlog").join("abc.log"),
        file_at_delete: Mutex::new(None),
    });
    let cluster = Cluster::start(
        Arc::new(config),
        ClusterDeps {
            registry: registry.clone(),
            clock: system_clock(),
            metrics: PipelineMetrics::unregistered().unwrap(),
            status: Arc::new(LogStatusSink),
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let raw = serde_json::to_vec(&serde_json::json!({
        "event_id": "abc",
        "step": "build",
        "message": "flushed first",
        "level": "info",
    }))
    .unwrap();
    cluster.store().inputs().event.send(Bytes::from(raw)).await.unwrap();
    let stores = cluster.store().stores().clone();
    assert!(eventually(|| stores.event.len() == 1).await);

    cluster.stop().await;

    let seen = registry.file_at_delete.lock().clone().unwrap();
    assert!(seen.ends_with(" flushed first\n"));
}
