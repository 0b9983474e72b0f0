use super::table::BarrelTable;
use super::{StoreContext, record_flush};
use crate::barrel::{
    Barrel, BarrelEvent, BarrelPool, DockerLogBarrel, SharedMessage, Subscription,
};
use crate::error::{EventLogError, Result};
use crate::persistence::MessagePersister;
use chrono::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const STORE: &str = "docker";
const POOL_IDLE: usize = 64;

pub fn docker_idle() -> Duration {
    Duration::minutes(1)
}

/// Container stdout store. Barrels live as long as someone watches them or
/// lines keep arriving.
pub struct DockerLogStore {
    ctx: StoreContext,
    table: BarrelTable<DockerLogBarrel>,
    persister: Arc<dyn MessagePersister>,
    events: Arc<Mutex<mpsc::Receiver<BarrelEvent>>>,
    window_messages: AtomicU64,
}

impl DockerLogStore {
    pub fn new(
        ctx: StoreContext,
        cache_size: usize,
        subscriber_capacity: usize,
        event_capacity: usize,
        persister: Arc<dyn MessagePersister>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(event_capacity.max(1));
        let pool = BarrelPool::new(POOL_IDLE, move || {
            DockerLogBarrel::new(cache_size, subscriber_capacity, tx.clone())
        });
        Self {
            ctx,
            table: BarrelTable::new(pool),
            persister,
            events: Arc::new(Mutex::new(rx)),
            window_messages: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, message: SharedMessage) -> Result<()> {
        if message.event_id.is_empty() {
            self.ctx.metrics.dropped(STORE, "empty_id");
            return Err(EventLogError::InvalidMessage(
                "container log without service id".to_string(),
            ));
        }

        let barrel = self.barrel(&message.event_id);
        let missed = barrel.insert(message, self.ctx.clock.now());
        if missed > 0 {
            self.ctx
                .metrics
                .store_dropped
                .with_label_values(&[STORE, "subscriber_full"])
                .inc_by(missed as u64);
        }

        self.window_messages.fetch_add(1, Ordering::Relaxed);
        self.ctx
            .metrics
            .store_messages
            .with_label_values(&[STORE])
            .inc();
        Ok(())
    }

    fn barrel(&self, service_id: &str) -> Arc<DockerLogBarrel> {
        let now = self.ctx.clock.now();
        self.table
            .get_or_create(service_id, |barrel| barrel.seed(service_id, now))
    }

    /// Attaches a live subscriber. The barrel is created if no producer has
    /// written yet; container logs are not replayed.
    pub fn subscribe(&self, service_id: &str, sub_id: &str) -> Subscription {
        self.barrel(service_id).subscribe(sub_id)
    }

    pub fn release(&self, service_id: &str, sub_id: &str) -> bool {
        self.table
            .get(service_id)
            .is_some_and(|barrel| barrel.del_sub_chan(sub_id))
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<DockerLogBarrel>> {
        self.table.get(service_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub async fn handle_barrel_event(&self, event: BarrelEvent) {
        match event {
            BarrelEvent::Persistence(service_id) => {
                if let Some(barrel) = self.table.get(&service_id) {
                    if barrel.needs_persistence() {
                        self.flush(&barrel).await;
                    }
                }
            }
            other => tracing::debug!("Ignoring {:?} on container log store", other),
        }
    }

    async fn flush(&self, barrel: &DockerLogBarrel) {
        let outcome = barrel.flush(self.persister.as_ref()).await;
        record_flush(&self.ctx, STORE, outcome);
    }

    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: usize,
        tracker: &TaskTracker,
        token: &CancellationToken,
    ) {
        for _ in 0..workers.max(1) {
            let store = self.clone();
            let token = token.clone();
            tracker.spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = token.cancelled() => break,
                        event = async { store.events.lock().await.recv().await } => event,
                    };
                    match event {
                        Some(event) => store.handle_barrel_event(event).await,
                        None => break,
                    }
                }
            });
        }
    }

    /// Re-flushes quiet barrels whose last persistence is over a minute old,
    /// then collects barrels idle for a minute with nobody watching.
    pub async fn gc(&self) {
        let now = self.ctx.clock.now();
        for barrel in self.table.snapshot() {
            if barrel.stage_if_stale(now) {
                self.flush(&barrel).await;
            }
        }

        let candidates = self.table.idle_candidates(now, docker_idle(), true);
        let mut ids = Vec::with_capacity(candidates.len());
        for barrel in candidates {
            barrel.gc_persistence();
            self.flush(&barrel).await;
            ids.push(barrel.id().to_string());
        }

        for barrel in self.table.remove_idle(&ids, now, docker_idle(), true) {
            barrel.gc_persistence();
            self.flush(&barrel).await;
            self.persister.release(barrel.id());
            self.table.recycle(barrel);
        }

        self.ctx
            .metrics
            .store_barrels
            .with_label_values(&[STORE])
            .set(self.table.len() as i64);
    }

    pub async fn flush_all(&self) {
        for barrel in self.table.snapshot() {
            barrel.gc_persistence();
            self.flush(&barrel).await;
        }
    }

    pub fn monitor_counts(&self) -> (u64, u64) {
        (
            self.table.len() as u64,
            self.window_messages.load(Ordering::Relaxed),
        )
    }

    pub fn reset_window(&self) {
        self.window_messages.store(0, Ordering::Relaxed);
    }
}
