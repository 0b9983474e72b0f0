use super::instance::{INSTANCE_PREFIX, Instance, InstanceStatus};
use crate::error::{EventLogError, Result};
use crate::registry::{Registry, WatchEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Added(Instance),
    Removed(Instance),
}

/// Cluster membership backed by the registry's `instance/` records.
pub struct Discovery {
    registry: Arc<dyn Registry>,
    local: Mutex<Instance>,
    others: Mutex<HashMap<String, Instance>>,
    events: broadcast::Sender<MembershipEvent>,
    stopping: AtomicBool,
}

impl Discovery {
    pub fn new(registry: Arc<dyn Registry>, local: Instance) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            registry,
            local: Mutex::new(local),
            others: Mutex::new(HashMap::new()),
            events,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn host_id(&self) -> String {
        self.local.lock().host_id.clone()
    }

    pub fn local(&self) -> Instance {
        self.local.lock().clone()
    }

    pub fn others(&self) -> Vec<Instance> {
        self.others.lock().values().cloned().collect()
    }

    /// Looks up any member, this instance included.
    pub fn get_instance(&self, host_id: &str) -> Option<Instance> {
        let local = self.local();
        if local.host_id == host_id {
            return Some(local);
        }
        self.others.lock().get(host_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Registers this instance, loads the current members and keeps
    /// following the `instance/` prefix until `token` is cancelled.
    pub async fn start(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut watch = self.registry.watch_prefix(INSTANCE_PREFIX).await?;

        let local = self.local();
        self.registry.put(&local.key(), &local.encode()?).await?;
        tracing::info!(
            "Registered instance {} at {}",
            local.host_id,
            local.pub_addr()
        );

        for (key, value) in self.registry.get_prefix(INSTANCE_PREFIX).await? {
            self.apply(WatchEvent::Put { key, value }).await;
        }

        let discovery = self.clone();
        let token = token.clone();
        tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = watch.recv() => event,
                };
                match event {
                    Some(event) => discovery.apply(event).await,
                    None => {
                        tracing::error!("Instance watch closed");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put { key, value } => self.apply_put(&key, &value).await,
            WatchEvent::Delete { key } => self.apply_delete(&key).await,
        }
    }

    async fn apply_put(&self, key: &str, value: &[u8]) {
        let instance = match Instance::decode(value) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!("Ignoring instance record {}: {}", key, e);
                return;
            }
        };

        if instance.host_id == self.host_id() {
            if matches!(
                instance.status,
                InstanceStatus::Abnormal | InstanceStatus::Delete
            ) {
                tracing::warn!("Own instance record was marked {:?}", instance.status);
                self.refresh_self().await;
            }
            return;
        }

        if instance.status == InstanceStatus::Delete {
            self.remove_other(&instance.host_id);
            return;
        }

        let previous = self
            .others
            .lock()
            .insert(instance.host_id.clone(), instance.clone());
        match previous {
            None => {
                tracing::info!(
                    "Discovered instance {} at {}",
                    instance.host_id,
                    instance.pub_addr()
                );
                let _ = self.events.send(MembershipEvent::Added(instance));
            }
            Some(previous) if previous.pub_addr() != instance.pub_addr() => {
                let _ = self.events.send(MembershipEvent::Removed(previous));
                let _ = self.events.send(MembershipEvent::Added(instance));
            }
            Some(_) => {}
        }
    }

    async fn apply_delete(&self, key: &str) {
        if key == self.local.lock().key() {
            if !self.stopping.load(Ordering::SeqCst) {
                tracing::warn!("Own instance record was deleted");
                self.refresh_self().await;
            }
            return;
        }

        let host_id = self
            .others
            .lock()
            .values()
            .find(|instance| instance.key() == key)
            .map(|instance| instance.host_id.clone());
        if let Some(host_id) = host_id {
            self.remove_other(&host_id);
        }
    }

    fn remove_other(&self, host_id: &str) {
        let removed = self.others.lock().remove(host_id);
        if let Some(instance) = removed {
            tracing::info!("Instance {} left the cluster", instance.host_id);
            let _ = self.events.send(MembershipEvent::Removed(instance));
        }
    }

    /// Rewrites this instance's record as healthy.
    async fn refresh_self(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let local = {
            let mut local = self.local.lock();
            local.status = InstanceStatus::Update;
            local.tag_number = 0;
            local.clone()
        };
        let result = match local.encode() {
            Ok(raw) => self.registry.put(&local.key(), &raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!("Failed to refresh own instance record: {}", e);
        }
    }

    /// Health verdict for a peer that stopped reporting. Tags the peer's
    /// record abnormal; once the tag count passes a majority of the locally
    /// known cluster size the record is deleted.
    pub async fn instance_check_health(&self, host_id: &str) -> Result<InstanceStatus> {
        if host_id == self.host_id() {
            return Ok(InstanceStatus::Abnormal);
        }

        let Some(known) = self.others.lock().get(host_id).cloned() else {
            return Ok(InstanceStatus::Delete);
        };
        let key = known.key();

        let mut record = match self.registry.get(&key).await? {
            Some(raw) => Instance::decode(&raw).unwrap_or(known),
            None => {
                self.remove_other(host_id);
                return Ok(InstanceStatus::Delete);
            }
        };
        record.status = InstanceStatus::Abnormal;
        record.tag_number += 1;

        let peers = self.others.lock().len();
        if record.tag_number as usize > (peers + 1) / 2 {
            tracing::warn!(
                "Evicting instance {} after {} abnormal tags",
                host_id,
                record.tag_number
            );
            self.registry.delete(&key).await?;
            self.remove_other(host_id);
            return Ok(InstanceStatus::Delete);
        }

        self.registry.put(&key, &record.encode()?).await?;
        tracing::warn!(
            "Instance {} tagged abnormal ({} tags)",
            host_id,
            record.tag_number
        );
        Ok(InstanceStatus::Abnormal)
    }

    /// Deletes this instance's record so peers drop their subscriptions.
    pub async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let key = self.local.lock().key();
        self.registry.delete(&key).await?;
        tracing::info!("Deregistered instance record {}", key);
        Ok(())
    }
}

/// The configured host IP, or the first non-loopback IPv4 address of this
/// machine.
pub fn detect_host_ip(configured: Option<&str>) -> Result<String> {
    if let Some(ip) = configured.map(str::trim).filter(|ip| !ip.is_empty()) {
        return Ok(ip.to_string());
    }

    let interfaces = if_addrs::get_if_addrs()?;
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip.to_string()),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| EventLogError::Config("no non-loopback IPv4 address found".to_string()))
}
