//! Eventlog core: clustered ingestion of operation events, container stdout
//! and monitor samples.
//!
//! Producers reach a node through [`ingress`]. Messages land in per-id
//! [`barrel`]s owned by the [`store`] layer, are flushed by the
//! [`persistence`] plugins and fanned out to local subscribers through the
//! [`hub`]. Nodes find each other through the [`registry`] and relay
//! locally-ingested events to every peer over the [`cluster`] pub/sub
//! sockets.

pub mod barrel;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hub;
pub mod ingress;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod status;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use cluster::{Cluster, ClusterDeps, Discovery, Distribution, Instance, InstanceStatus};
pub use config::{EventLogConfig, RegistryBackend};
pub use error::{EventLogError, Result};
pub use hub::{SubscriptionHub, SubscriptionKind};
pub use ingress::{IngressAddrs, IngressServers};
pub use message::{ClusterMessage, ClusterMode, EventLogMessage, MonitorData, check_level};
pub use metrics::PipelineMetrics;
pub use persistence::{EventLogLine, read_event_log, tail_docker_log};
pub use registry::{MemoryRegistry, Registry, RegistryBuilder, WatchEvent};
pub use status::{LogStatusSink, StatusSink};
pub use store::{StoreInputs, StoreManager, Stores};
