//! Ingress listeners
//!
//! Each listener pushes raw payloads into one of the store's input channels
//! and never blocks on a full channel: the message is dropped and counted.

pub mod framed;
pub mod grpc;
pub mod udp;

pub use framed::{ContainerLogCodec, FramedLogServer, HEARTBEAT, LogFrame};
pub use grpc::{EventLogService, GrpcServer};
pub use udp::DatagramServer;

use crate::config::EntryConfig;
use crate::error::{EventLogError, Result};
use crate::metrics::PipelineMetrics;
use crate::store::StoreInputs;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub(crate) fn push(
    listener: &str,
    tx: &mpsc::Sender<Bytes>,
    payload: Bytes,
    metrics: &PipelineMetrics,
) -> bool {
    match tx.try_send(payload) {
        Ok(()) => {
            metrics
                .ingress_messages
                .with_label_values(&[listener])
                .inc();
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("{} input channel full, dropping message", listener);
            metrics.ingress_dropped.with_label_values(&[listener]).inc();
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!("{} input channel closed, dropping message", listener);
            metrics.ingress_dropped.with_label_values(&[listener]).inc();
            false
        }
    }
}

/// Bound addresses of the running listeners.
#[derive(Debug, Clone)]
pub struct IngressAddrs {
    pub event_log: SocketAddr,
    pub docker_log: SocketAddr,
    pub new_monitor: Option<SocketAddr>,
    pub monitor: Option<SocketAddr>,
}

pub struct IngressServers {
    addrs: IngressAddrs,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl IngressServers {
    /// Binds every enabled listener and starts serving. A bind failure is
    /// returned; later transport failures go to `fatal`.
    pub async fn start(
        config: &EntryConfig,
        inputs: StoreInputs,
        metrics: PipelineMetrics,
        parent: &CancellationToken,
        fatal: mpsc::Sender<EventLogError>,
    ) -> Result<Self> {
        let token = parent.child_token();
        let tracker = TaskTracker::new();

        let grpc = GrpcServer::bind(&config.event_log_server.addr()).await?;
        let event_log = grpc.local_addr()?;

        let framed = FramedLogServer::bind(
            &config.docker_log_server.addr(),
            Duration::from_secs(config.docker_log_server.idle_timeout_secs),
        )
        .await?;
        let docker_log = framed.local_addr()?;

        let new_monitor = if config.new_monitor_message_server.enabled {
            Some(
                DatagramServer::bind("new_monitor", &config.new_monitor_message_server.addr())
                    .await?,
            )
        } else {
            None
        };
        let monitor = if config.monitor_message_server.enabled {
            Some(DatagramServer::bind("monitor", &config.monitor_message_server.addr()).await?)
        } else {
            None
        };

        let addrs = IngressAddrs {
            event_log,
            docker_log,
            new_monitor: new_monitor.as_ref().map(|s| s.local_addr()).transpose()?,
            monitor: monitor.as_ref().map(|s| s.local_addr()).transpose()?,
        };

        grpc.run(
            EventLogService::new(inputs.event.clone(), metrics.clone()),
            &tracker,
            token.clone(),
            fatal,
        );
        framed.run(inputs.docker.clone(), metrics.clone(), &tracker, token.clone());
        if let Some(server) = new_monitor {
            server.run(inputs.new_monitor.clone(), metrics.clone(), &tracker, token.clone());
        }
        if let Some(server) = monitor {
            server.run(inputs.monitor.clone(), metrics, &tracker, token.clone());
        }

        tracing::info!("Ingress listeners started: {:?}", addrs);
        Ok(Self {
            addrs,
            tracker,
            token,
        })
    }

    pub fn addrs(&self) -> &IngressAddrs {
        &self.addrs
    }

    pub async fn stop(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Ingress listeners stopped");
    }
}
