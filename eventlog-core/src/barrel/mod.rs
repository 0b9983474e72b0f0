//! Barrels: per-producer in-memory accumulators.
//!
//! A barrel buffers recent messages for one producer id, stages them for
//! persistence and fans them out to subscribers. Stores own barrels; the
//! subscriber channels are owned by the barrel and closed when it drops the
//! sender.

pub mod docker;
pub mod event;
pub mod monitor;
pub mod pool;
pub mod read;
pub mod subscriber;

pub use docker::DockerLogBarrel;
pub use event::EventBarrel;
pub use monitor::{HostRecord, MonitorBarrel, merge_monitor, top_monitor};
pub use pool::{BarrelPool, Poolable};
pub use read::ReadBarrel;
pub use subscriber::{SubscriberSet, Subscription};

use crate::error::EventLogError;
use crate::message::EventLogMessage;
use crate::persistence::MessagePersister;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SharedMessage = Arc<EventLogMessage>;

/// Notification from a barrel to its store's worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrelEvent {
    /// Staged messages are waiting for the persistence plugin.
    Persistence(String),
    /// A terminal step arrived for the producer.
    Callback {
        event_id: String,
        status: String,
        message: String,
    },
    CodeVersion {
        event_id: String,
        message: String,
    },
}

/// Common view the store's table and GC need of every barrel flavor.
pub trait Barrel: Poolable + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn update_time(&self) -> DateTime<Utc>;

    fn subscriber_count(&self) -> usize {
        0
    }

    /// Drops every subscriber sender, closing their channels.
    fn close_subscribers(&self) {}
}

/// Non-blocking publish of a barrel event. A full channel drops the event;
/// the data it refers to stays staged and the next trigger re-emits.
pub(crate) fn emit(events: &mpsc::Sender<BarrelEvent>, event: BarrelEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::warn!("Barrel event channel full, dropping {:?}", event);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Hot buffer plus persistence staging buffer.
#[derive(Debug, Default)]
pub struct PersistBuffer {
    hot: Vec<SharedMessage>,
    staging: Vec<SharedMessage>,
}

impl PersistBuffer {
    pub fn push(&mut self, message: SharedMessage) {
        self.hot.push(message);
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    /// Moves the hot buffer behind whatever is already staged.
    pub fn stage(&mut self) {
        if self.staging.is_empty() {
            std::mem::swap(&mut self.hot, &mut self.staging);
        } else {
            self.staging.append(&mut self.hot);
        }
    }

    pub fn take_staging(&mut self) -> Vec<SharedMessage> {
        std::mem::take(&mut self.staging)
    }

    pub fn clear(&mut self) {
        self.hot.clear();
        self.staging.clear();
    }
}

/// Result of driving a barrel's staged messages into its plugin.
#[derive(Debug)]
pub enum FlushOutcome {
    Empty,
    Persisted(usize),
    Failed {
        error: EventLogError,
        messages: Vec<SharedMessage>,
    },
}

pub(crate) async fn flush_staged(
    id: &str,
    staged: Vec<SharedMessage>,
    persister: &dyn MessagePersister,
) -> FlushOutcome {
    if staged.is_empty() {
        return FlushOutcome::Empty;
    }

    match persister.save(id, &staged).await {
        Ok(()) => FlushOutcome::Persisted(staged.len()),
        Err(error) => FlushOutcome::Failed {
            error,
            messages: staged,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> SharedMessage {
        Arc::new(EventLogMessage {
            message: text.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_stage_preserves_order() {
        let mut buffer = PersistBuffer::default();
        buffer.push(msg("a"));
        buffer.stage();
        buffer.push(msg("b"));
        buffer.push(msg("c"));
        buffer.stage();
        assert_eq!(buffer.hot_len(), 0);
        let staged: Vec<String> = buffer
            .take_staging()
            .iter()
            .map(|m| m.message.clone())
            .collect();
        assert_eq!(staged, vec!["a", "b", "c"]);
        assert_eq!(buffer.staging_len(), 0);
    }

    #[tokio::test]
    async fn test_emit_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(emit(&tx, BarrelEvent::Persistence("a".to_string())));
        assert!(!emit(&tx, BarrelEvent::Persistence("b".to_string())));
        assert_eq!(rx.recv().await, Some(BarrelEvent::Persistence("a".to_string())));
    }
}
