//! Persistence plugins
//!
//! Provides the per-event operation log file and the daily-rotated container
//! stdout file.

pub mod docker_file;
pub mod event_file;

pub use docker_file::{DockerLogPersister, service_alias_id, tail_docker_log};
pub use event_file::{EventFilePersister, EventLogLine, read_event_log};

use crate::error::Result;
use crate::message::EventLogMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// A sink that durably stores a batch of staged messages for one producer.
#[async_trait]
pub trait MessagePersister: Send + Sync {
    fn name(&self) -> &'static str;

    /// Appends `messages` for `id`. On error nothing is assumed durable.
    async fn save(&self, id: &str, messages: &[Arc<EventLogMessage>]) -> Result<()>;

    /// Drops any per-producer state once its barrel is collected.
    fn release(&self, _id: &str) {}
}
