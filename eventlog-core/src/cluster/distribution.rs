use super::discover::Discovery;
use super::instance::InstanceStatus;
use crate::clock::{SharedClock, is_older_than};
use crate::error::Result;
use crate::message::MonitorData;
use crate::registry::Registry;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const OWNER_PREFIX: &str = "dockerloginstacne/";

pub fn owner_key(service_id: &str) -> String {
    format!("{}{}", OWNER_PREFIX, service_id)
}

#[derive(Debug, Default)]
struct LoadTable {
    monitor_datas: HashMap<String, MonitorData>,
    update_time: HashMap<String, DateTime<Utc>>,
    first_seen: HashMap<String, u64>,
    next_seq: u64,
    abnormal_node: HashSet<String>,
}

/// Picks the instance that should own a producer, from the load each
/// instance reports on the `monitor` topic.
pub struct Distribution {
    discovery: Arc<Discovery>,
    registry: Arc<dyn Registry>,
    clock: SharedClock,
    stale: Duration,
    table: Mutex<LoadTable>,
}

impl Distribution {
    pub fn new(
        discovery: Arc<Discovery>,
        registry: Arc<dyn Registry>,
        clock: SharedClock,
        stale: std::time::Duration,
    ) -> Self {
        Self {
            discovery,
            registry,
            clock,
            stale: Duration::from_std(stale).unwrap_or_else(|_| Duration::seconds(10)),
            table: Mutex::new(LoadTable::default()),
        }
    }

    pub fn update(&self, data: MonitorData) {
        if data.instance_id.is_empty() {
            tracing::warn!("Dropping monitor data without instance id");
            return;
        }

        let now = self.clock.now();
        let mut table = self.table.lock();
        if !table.first_seen.contains_key(&data.instance_id) {
            let seq = table.next_seq;
            table.next_seq += 1;
            table.first_seen.insert(data.instance_id.clone(), seq);
        }
        table.abnormal_node.remove(&data.instance_id);
        table.update_time.insert(data.instance_id.clone(), now);
        table.monitor_datas.insert(data.instance_id.clone(), data);
    }

    pub fn monitor_data(&self, instance_id: &str) -> Option<MonitorData> {
        self.table.lock().monitor_datas.get(instance_id).cloned()
    }

    pub fn is_abnormal(&self, instance_id: &str) -> bool {
        self.table.lock().abnormal_node.contains(instance_id)
    }

    /// Asks discovery about every instance that has not reported for longer
    /// than the stale threshold.
    pub async fn check_health(&self) {
        let now = self.clock.now();
        let stale: Vec<String> = self
            .table
            .lock()
            .update_time
            .iter()
            .filter(|(_, since)| is_older_than(now, **since, self.stale))
            .map(|(id, _)| id.clone())
            .collect();

        for instance_id in stale {
            match self.discovery.instance_check_health(&instance_id).await {
                Ok(InstanceStatus::Delete) => {
                    let mut table = self.table.lock();
                    table.monitor_datas.remove(&instance_id);
                    table.update_time.remove(&instance_id);
                    table.first_seen.remove(&instance_id);
                    table.abnormal_node.remove(&instance_id);
                    tracing::info!("Dropped load data of instance {}", instance_id);
                }
                Ok(InstanceStatus::Abnormal) => {
                    self.table.lock().abnormal_node.insert(instance_id);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Health check of instance {} failed: {}", instance_id, e);
                }
            }
        }
    }

    /// Owning instance id for `service_id`. A persisted owner sticks while it
    /// is healthy and reporting; otherwise the least loaded instance wins and
    /// the choice is persisted.
    pub async fn get_suitable_instance(&self, service_id: &str) -> Result<String> {
        let self_id = self.discovery.host_id();
        let key = owner_key(service_id);

        if let Some(raw) = self.registry.get(&key).await? {
            let owner = String::from_utf8_lossy(&raw).trim().to_string();
            if self.is_usable(&owner) {
                return Ok(owner);
            }
        }

        let chosen = {
            let table = self.table.lock();
            if table.monitor_datas.is_empty() {
                return Ok(self_id);
            }
            let mut candidates: Vec<(u64, u64, &String)> = table
                .monitor_datas
                .iter()
                .filter(|(id, _)| !table.abnormal_node.contains(*id))
                .map(|(id, data)| {
                    let seq = table.first_seen.get(id).copied().unwrap_or(u64::MAX);
                    (data.score(), seq, id)
                })
                .collect();
            candidates.sort();
            candidates.first().map(|(_, _, id)| (*id).clone())
        };

        let Some(chosen) = chosen else {
            return Ok(self_id);
        };

        if let Err(e) = self.registry.put(&key, chosen.as_bytes()).await {
            tracing::warn!("Failed to persist owner of {}: {}", service_id, e);
        }
        Ok(chosen)
    }

    fn is_usable(&self, instance_id: &str) -> bool {
        let now = self.clock.now();
        let table = self.table.lock();
        !table.abnormal_node.contains(instance_id)
            && table.monitor_datas.contains_key(instance_id)
            && table
                .update_time
                .get(instance_id)
                .is_some_and(|since| !is_older_than(now, *since, self.stale))
    }

    /// Runs [`Self::check_health`] every `period` until cancelled.
    pub fn start(
        self: &Arc<Self>,
        period: std::time::Duration,
        tracker: &TaskTracker,
        token: &CancellationToken,
    ) {
        let distribution = self.clone();
        let token = token.clone();
        tracker.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => distribution.check_health().await,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster::instance::Instance;
    use crate::registry::MemoryRegistry;

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

    fn load(id: &str, services: u64, logs: u64) -> MonitorData {
        MonitorData {
            instance_id: id.to_string(),
            service_size: services,
            log_size_per_minute: logs,
        }
    }

    fn distribution(registry: &MemoryRegistry, clock: Arc<ManualClock>) -> Distribution {
        let discovery = Arc::new(Discovery::new(
            Arc::new(registry.clone()),
            instance("self", 1),
        ));
        Distribution::new(
            discovery,
            Arc::new(registry.clone()),
            clock,
            std::time::Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_no_load_data_routes_to_self() {
        let registry = MemoryRegistry::new("/home");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let distribution = distribution(&registry, clock);
        assert_eq!(distribution.get_suitable_instance("svc").await.unwrap(), "self");
    }

    #[tokio::test]
    async fn test_lowest_score_wins_and_sticks() {
        let registry = MemoryRegistry::new("/home");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let distribution = distribution(&registry, clock);

        distribution.update(load("self", 10, 100));
        distribution.update(load("b", 1, 50));
        distribution.update(load("c", 2, 10));
        // b: 50 + 20, c: 10 + 40
        assert_eq!(distribution.get_suitable_instance("svc").await.unwrap(), "c");
        assert_eq!(
            registry.get(&owner_key("svc")).await.unwrap(),
            Some(b"c".to_vec())
        );

        distribution.update(load("c", 5, 500));
        assert_eq!(distribution.get_suitable_instance("svc").await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_equal_scores_prefer_first_seen() {
        let registry = MemoryRegistry::new("/home");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let distribution = distribution(&registry, clock);

        distribution.update(load("zz", 1, 0));
        distribution.update(load("aa", 1, 0));
        assert_eq!(distribution.get_suitable_instance("svc").await.unwrap(), "zz");
    }

    #[tokio::test]
    async fn test_stale_instance_is_suppressed() {
        let registry = MemoryRegistry::new("/home");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let distribution = distribution(&registry, clock.clone());

        distribution.update(load("gone", 0, 0));
        clock.advance(Duration::seconds(11));
        distribution.update(load("self", 3, 30));

        // "gone" is unknown to discovery, so the check reports it deleted
        distribution.check_health().await;
        assert!(distribution.monitor_data("gone").is_none());
        assert_eq!(distribution.get_suitable_instance("svc").await.unwrap(), "self");
    }
}
