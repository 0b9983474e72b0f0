use super::{Barrel, Poolable, SharedMessage, SubscriberSet, Subscription};
use crate::clock::is_older_than;
use crate::error::Result;
use crate::message::{EventLogMessage, MonitorMessage, MonitorReport};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Published lists never exceed this many keys.
pub const MONITOR_TOP_N: usize = 20;

/// Host contributions not refreshed within this window are dropped.
pub fn host_expiry() -> Duration {
    Duration::seconds(30)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub host_name: String,
    pub update_time: DateTime<Utc>,
    pub messages: Vec<MonitorMessage>,
}

/// Merges all host records by key, preserving first-seen key order.
pub fn merge_monitor(hosts: &[HostRecord]) -> Vec<MonitorMessage> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut merged: Vec<MonitorMessage> = Vec::new();
    for host in hosts {
        for message in &host.messages {
            match index.get(message.key.as_str()) {
                Some(&at) => merged[at].merge(message),
                None => {
                    index.insert(message.key.as_str(), merged.len());
                    merged.push(message.clone());
                }
            }
        }
    }
    merged
}

/// Sorts descending by cumulative time and keeps the top entries.
pub fn top_monitor(mut merged: Vec<MonitorMessage>) -> Vec<MonitorMessage> {
    merged.sort_by(|a, b| b.cumulative_time.total_cmp(&a.cumulative_time));
    merged.truncate(MONITOR_TOP_N);
    merged
}

#[derive(Debug)]
struct MonitorState {
    hosts: Vec<HostRecord>,
    subs: SubscriberSet,
    update_time: DateTime<Utc>,
}

/// Per-service aggregation of monitor samples reported by many hosts.
pub struct MonitorBarrel {
    service_id: String,
    inner: Mutex<MonitorState>,
}

impl MonitorBarrel {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            service_id: String::new(),
            inner: Mutex::new(MonitorState {
                hosts: Vec::new(),
                subs: SubscriberSet::new(subscriber_capacity),
                update_time: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }

    pub(crate) fn seed(&mut self, service_id: &str, now: DateTime<Utc>) {
        self.service_id = service_id.to_string();
        self.inner.get_mut().update_time = now;
    }

    /// Records `report`, expires stale hosts and pushes the merged top list
    /// to every subscriber. Returns the published JSON.
    pub fn insert(&self, report: MonitorReport, now: DateTime<Utc>) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        inner.update_time = now;

        match inner
            .hosts
            .iter_mut()
            .find(|host| host.host_name == report.host_name)
        {
            Some(host) => {
                host.update_time = now;
                host.messages = report.messages;
            }
            None => inner.hosts.push(HostRecord {
                host_name: report.host_name,
                update_time: now,
                messages: report.messages,
            }),
        }

        inner
            .hosts
            .retain(|host| !is_older_than(now, host.update_time, host_expiry()));

        let top = top_monitor(merge_monitor(&inner.hosts));
        let data = Bytes::from(serde_json::to_vec(&top)?);

        let message: SharedMessage = Arc::new(EventLogMessage {
            event_id: self.service_id.clone(),
            monitor_data: Some(data.clone()),
            content: data.clone(),
            ..Default::default()
        });
        inner.subs.broadcast(&message);

        Ok(data)
    }

    pub fn subscribe(&self, sub_id: &str) -> Subscription {
        self.inner.lock().subs.add(sub_id, [])
    }

    pub fn del_sub_chan(&self, sub_id: &str) -> bool {
        self.inner.lock().subs.remove(sub_id)
    }

    pub fn host_count(&self) -> usize {
        self.inner.lock().hosts.len()
    }
}

impl Poolable for MonitorBarrel {
    fn reset(&mut self) {
        self.service_id.clear();
        let inner = self.inner.get_mut();
        inner.hosts.clear();
        inner.subs.clear();
        inner.update_time = DateTime::<Utc>::MIN_UTC;
    }
}

impl Barrel for MonitorBarrel {
    fn id(&self) -> &str {
        &self.service_id
    }

    fn update_time(&self) -> DateTime<Utc> {
        self.inner.lock().update_time
    }

    fn subscriber_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    fn close_subscribers(&self) {
        self.inner.lock().subs.clear();
    }
}
