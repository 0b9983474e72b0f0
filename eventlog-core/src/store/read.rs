use super::StoreContext;
use super::table::BarrelTable;
use crate::barrel::{Barrel, BarrelPool, ReadBarrel, SharedMessage, Subscription};
use crate::error::{EventLogError, Result};
use chrono::Duration;
use std::sync::Arc;

const POOL_IDLE: usize = 64;

/// Live relay store without persistence. Used for the operation-log relay
/// (which replays a bounded cache to late subscribers) and the legacy monitor
/// relay.
pub struct ReadStore {
    name: &'static str,
    ctx: StoreContext,
    table: BarrelTable<ReadBarrel>,
    idle: Duration,
    require_no_subscribers: bool,
}

impl ReadStore {
    pub fn new(
        name: &'static str,
        ctx: StoreContext,
        cache_limit: usize,
        subscriber_capacity: usize,
        idle: Duration,
        require_no_subscribers: bool,
    ) -> Self {
        let pool = BarrelPool::new(POOL_IDLE, move || {
            ReadBarrel::new(cache_limit, subscriber_capacity)
        });
        Self {
            name,
            ctx,
            table: BarrelTable::new(pool),
            idle,
            require_no_subscribers,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn insert(&self, message: SharedMessage) -> Result<()> {
        if message.event_id.is_empty() {
            self.ctx.metrics.dropped(self.name, "empty_id");
            return Err(EventLogError::InvalidMessage(format!(
                "{} message without id",
                self.name
            )));
        }

        let missed = self.barrel(&message.event_id).insert(message, self.ctx.clock.now());
        if missed > 0 {
            self.ctx
                .metrics
                .store_dropped
                .with_label_values(&[self.name, "subscriber_full"])
                .inc_by(missed as u64);
        }
        self.ctx
            .metrics
            .store_messages
            .with_label_values(&[self.name])
            .inc();
        Ok(())
    }

    fn barrel(&self, id: &str) -> Arc<ReadBarrel> {
        let now = self.ctx.clock.now();
        self.table.get_or_create(id, |barrel| barrel.seed(id, now))
    }

    /// Replays whatever the barrel still caches, then streams new messages.
    pub fn subscribe(&self, id: &str, sub_id: &str) -> Subscription {
        self.barrel(id).subscribe(sub_id)
    }

    pub fn release(&self, id: &str, sub_id: &str) -> bool {
        self.table
            .get(id)
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
            .idle_candidates(now, self.idle, self.require_no_subscribers)
            .iter()
            .map(|barrel| barrel.id().to_string())
            .collect();

        let removed = self
            .table
            .remove_idle(&ids, now, self.idle, self.require_no_subscribers);
        if !removed.is_empty() {
            tracing::debug!("{} store collected {} barrels", self.name, removed.len());
        }
        for barrel in removed {
            self.table.recycle(barrel);
        }

        self.ctx
            .metrics
            .store_barrels
            .with_label_values(&[self.name])
            .set(self.table.len() as i64);
    }
}
