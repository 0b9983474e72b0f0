//! Typed dispatch from `(kind, id)` watch requests to the owning store.

use crate::barrel::Subscription;
use crate::error::{EventLogError, Result};
use crate::store::Stores;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Live operation events.
    Event,
    /// Container stdout.
    Docker,
    /// Legacy monitor messages.
    Monitor,
    /// Merged monitor top list.
    NewMonitor,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Event => "event",
            SubscriptionKind::Docker => "docker",
            SubscriptionKind::Monitor => "monitor",
            SubscriptionKind::NewMonitor => "newmonitor",
        }
    }
}

impl FromStr for SubscriptionKind {
    type Err = EventLogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(SubscriptionKind::Event),
            "docker" => Ok(SubscriptionKind::Docker),
            "monitor" => Ok(SubscriptionKind::Monitor),
            "newmonitor" => Ok(SubscriptionKind::NewMonitor),
            other => Err(EventLogError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless front door for the presentation layer. The channel returned by
/// [`SubscriptionHub::subscribe`] is owned by the barrel; it closes on
/// [`SubscriptionHub::release`] or when the barrel is collected.
#[derive(Clone)]
pub struct SubscriptionHub {
    stores: Arc<Stores>,
}

impl SubscriptionHub {
    pub fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }

    pub fn subscribe(&self, kind: SubscriptionKind, id: &str, sub_id: &str) -> Result<Subscription> {
        if id.is_empty() {
            return Err(EventLogError::InvalidMessage(
                "subscription id cannot be empty".to_string(),
            ));
        }
        tracing::debug!("Subscriber {} watching {} {}", sub_id, kind, id);
        Ok(match kind {
            SubscriptionKind::Event => self.stores.read.subscribe(id, sub_id),
            SubscriptionKind::Docker => self.stores.docker.subscribe(id, sub_id),
            SubscriptionKind::Monitor => self.stores.monitor_relay.subscribe(id, sub_id),
            SubscriptionKind::NewMonitor => self.stores.monitor.subscribe(id, sub_id),
        })
    }

    /// Returns whether the subscriber was still attached.
    pub fn release(&self, kind: SubscriptionKind, id: &str, sub_id: &str) -> bool {
        match kind {
            SubscriptionKind::Event => self.stores.read.release(id, sub_id),
            SubscriptionKind::Docker => self.stores.docker.release(id, sub_id),
            SubscriptionKind::Monitor => self.stores.monitor_relay.release(id, sub_id),
            SubscriptionKind::NewMonitor => self.stores.monitor.release(id, sub_id),
        }
    }
}
