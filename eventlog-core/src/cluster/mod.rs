//! Cluster peer layer and the supervisor that wires a node together.
//!
//! Start order: stores, discovery, pub socket, sub manager, distribution,
//! monitor tick. [`Cluster::stop`] walks the same list backwards.

pub mod discover;
pub mod distribution;
pub mod instance;
pub mod pub_socket;
pub mod sub_socket;
pub mod wire;

pub use discover::{Discovery, MembershipEvent, detect_host_ip};
pub use distribution::{Distribution, owner_key};
pub use instance::{Instance, InstanceStatus, instance_key};
pub use pub_socket::PubSocket;
pub use sub_socket::{SubManager, SubTimings};
pub use wire::MultipartCodec;

use crate::clock::SharedClock;
use crate::config::EventLogConfig;
use crate::error::{EventLogError, Result};
use crate::message::{ClusterMessage, ClusterMode};
use crate::metrics::PipelineMetrics;
use crate::registry::Registry;
use crate::status::StatusSink;
use crate::store::StoreManager;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const FATAL_BUFFER: usize = 8;

/// Everything a node needs from the outside world.
pub struct ClusterDeps {
    pub registry: Arc<dyn Registry>,
    pub clock: SharedClock,
    pub metrics: PipelineMetrics,
    pub status: Arc<dyn StatusSink>,
}

pub struct Cluster {
    config: Arc<EventLogConfig>,
    registry: Arc<dyn Registry>,
    store: Arc<StoreManager>,
    discovery: Arc<Discovery>,
    distribution: Arc<Distribution>,
    pub_socket: Arc<PubSocket>,
    sub_manager: Arc<SubManager>,
    /// Monitor tick and distribution health ticker.
    control_token: CancellationToken,
    /// Discovery watch.
    token: CancellationToken,
    tracker: TaskTracker,
    fatal_tx: mpsc::Sender<EventLogError>,
    fatal_rx: Mutex<Option<mpsc::Receiver<EventLogError>>>,
}

impl Cluster {
    pub async fn start(
        config: Arc<EventLogConfig>,
        deps: ClusterDeps,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let ClusterDeps {
            registry,
            clock,
            metrics,
            status,
        } = deps;
        let token = parent.child_token();
        let control_token = token.child_token();
        let tracker = TaskTracker::new();

        let store = Arc::new(StoreManager::new(
            &config.store,
            clock.clone(),
            metrics.clone(),
            status,
        )?);
        store.start(&token)?;

        let pub_addr = format!(
            "{}:{}",
            config.cluster.pub_bind_ip, config.cluster.pub_bind_port
        );
        let pub_socket = Arc::new(PubSocket::bind(&pub_addr, metrics.clone(), &token).await?);

        let local = Instance {
            host_id: config
                .cluster
                .instance_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| ulid::Ulid::new().to_string()),
            host_ip: detect_host_ip(config.cluster.host_ip.as_deref())?,
            pub_port: pub_socket.local_addr().port(),
            web_port: config.web.port,
            docker_log_port: config.entry.docker_log_server.bind_port,
            host_name: config.cluster.host_name_or_default(),
            status: InstanceStatus::Create,
            tag_number: 0,
        };
        let discovery = Arc::new(Discovery::new(registry.clone(), local));
        discovery.start(&tracker, &token).await?;

        let publish = store.take_publish_receiver().ok_or_else(|| {
            EventLogError::Internal("publish channel already taken".to_string())
        })?;
        pub_socket.run(publish, &tracker)?;

        let distribution = Arc::new(Distribution::new(
            discovery.clone(),
            registry.clone(),
            clock,
            std::time::Duration::from_secs(config.cluster.instance_stale_secs),
        ));

        let sub_manager = Arc::new(SubManager::new(
            discovery.clone(),
            distribution.clone(),
            store.inputs().sub,
            metrics,
            SubTimings {
                connect_timeout: config.cluster.peer_connect_timeout(),
                retry: config.cluster.peer_retry(),
                health: config.cluster.peer_health(),
            },
            &token,
        ));
        sub_manager.run(&tracker);

        distribution.start(
            config.cluster.distribution_health(),
            &tracker,
            &control_token,
        );

        let (fatal_tx, fatal_rx) = mpsc::channel(FATAL_BUFFER);
        let cluster = Self {
            config,
            registry,
            store,
            discovery,
            distribution,
            pub_socket,
            sub_manager,
            control_token,
            token,
            tracker,
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        };
        cluster.spawn_monitor_tick();

        tracing::info!(
            "Cluster node {} started, pub socket on {}",
            cluster.instance_id(),
            cluster.pub_socket.local_addr()
        );
        Ok(cluster)
    }

    /// Every tick: report this node's load to peers on the `monitor` topic
    /// and record it locally.
    fn spawn_monitor_tick(&self) {
        let store = self.store.clone();
        let distribution = self.distribution.clone();
        let control = self.pub_socket.control();
        let instance_id = self.instance_id();
        let token = self.control_token.clone();
        let period = self.config.cluster.monitor_tick();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let data = store.monitor_data(&instance_id);
                distribution.update(data.clone());
                let message = ClusterMessage::new(ClusterMode::Monitor, data.to_csv());
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = control.send(message) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn instance_id(&self) -> String {
        self.discovery.host_id()
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StoreManager> {
        &self.store
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn distribution(&self) -> &Arc<Distribution> {
        &self.distribution
    }

    pub fn pub_socket(&self) -> &Arc<PubSocket> {
        &self.pub_socket
    }

    pub fn sub_manager(&self) -> &Arc<SubManager> {
        &self.sub_manager
    }

    /// Components that hit an unrecoverable error report it here.
    pub fn fatal_sender(&self) -> mpsc::Sender<EventLogError> {
        self.fatal_tx.clone()
    }

    pub fn take_fatal_receiver(&self) -> Option<mpsc::Receiver<EventLogError>> {
        self.fatal_rx.lock().take()
    }

    /// Owning instance for `service_id`, with its record when known.
    pub async fn owner_of(&self, service_id: &str) -> Result<(String, Option<Instance>)> {
        let owner = self.distribution.get_suitable_instance(service_id).await?;
        let instance = self.discovery.get_instance(&owner);
        Ok((owner, instance))
    }

    /// Barrels are flushed before the instance record is deleted and the
    /// pub socket closes.
    pub async fn stop(&self) {
        tracing::info!("Stopping cluster node {}", self.instance_id());
        self.control_token.cancel();
        self.sub_manager.stop().await;
        self.store.stop().await;
        self.pub_socket.stop(&self.discovery).await;
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Cluster node stopped");
    }
}
