use super::StoreContext;
use super::table::BarrelTable;
use crate::barrel::{Barrel, BarrelPool, MonitorBarrel, Subscription};
use crate::error::{EventLogError, Result};
use crate::message::MonitorReport;
use bytes::Bytes;
use chrono::Duration;
use std::sync::Arc;

const STORE: &str = "new_monitor";
const POOL_IDLE: usize = 32;

pub fn monitor_idle() -> Duration {
    Duration::minutes(3)
}

/// Per-service monitor aggregation fed by local UDP reports and peers.
pub struct MonitorStore {
    ctx: StoreContext,
    table: BarrelTable<MonitorBarrel>,
}

impl MonitorStore {
    pub fn new(ctx: StoreContext, subscriber_capacity: usize) -> Self {
        let pool = BarrelPool::new(POOL_IDLE, move || MonitorBarrel::new(subscriber_capacity));
        Self {
            ctx,
            table: BarrelTable::new(pool),
        }
    }

    /// Merges `report` into its service's barrel and returns the top list
    /// pushed to subscribers.
    pub fn insert(&self, report: MonitorReport) -> Result<Bytes> {
        if report.service_id.is_empty() {
            self.ctx.metrics.dropped(STORE, "empty_id");
            return Err(EventLogError::InvalidMessage(
                "monitor report without service_id".to_string(),
            ));
        }

        let service_id = report.service_id.clone();
        let data = self.barrel(&service_id).insert(report, self.ctx.clock.now())?;
        self.ctx
            .metrics
            .store_messages
            .with_label_values(&[STORE])
            .inc();
        Ok(data)
    }

    fn barrel(&self, service_id: &str) -> Arc<MonitorBarrel> {
        let now = self.ctx.clock.now();
        self.table
            .get_or_create(service_id, |barrel| barrel.seed(service_id, now))
    }

    pub fn subscribe(&self, service_id: &str, sub_id: &str) -> Subscription {
        self.barrel(service_id).subscribe(sub_id)
    }

    pub fn release(&self, service_id: &str, sub_id: &str) -> bool {
        self.table
            .get(service_id)
            .is_some_and(|barrel| barrel.del_sub_chan(sub_id))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn gc(&self) {
        let now = self.ctx.clock.now();
        let ids: Vec<String> = self
            .table
            .idle_candidates(now, monitor_idle(), true)
            .iter()
            .map(|barrel| barrel.id().to_string())
            .collect();
        for barrel in self.table.remove_idle(&ids, now, monitor_idle(), true) {
            self.table.recycle(barrel);
        }

        self.ctx
            .metrics
            .store_barrels
            .with_label_values(&[STORE])
            .set(self.table.len() as i64);
    }
}
