use super::table::BarrelTable;
use super::{StoreContext, record_flush};
use crate::barrel::event::EventInsert;
use crate::barrel::{Barrel, BarrelEvent, BarrelPool, EventBarrel, SharedMessage};
use crate::error::{EventLogError, Result};
use crate::persistence::MessagePersister;
use crate::status::StatusSink;
use chrono::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const STORE: &str = "event";
const POOL_IDLE: usize = 64;

pub fn event_idle() -> Duration {
    Duration::seconds(30)
}

/// Operation-log store: one [`EventBarrel`] per event id, persisted to the
/// per-event file.
pub struct EventStore {
    ctx: StoreContext,
    table: BarrelTable<EventBarrel>,
    persister: Arc<dyn MessagePersister>,
    status: Arc<dyn StatusSink>,
    events: Arc<Mutex<mpsc::Receiver<BarrelEvent>>>,
    window_messages: AtomicU64,
}

impl EventStore {
    pub fn new(
        ctx: StoreContext,
        max_number: u64,
        cache_number: usize,
        event_capacity: usize,
        persister: Arc<dyn MessagePersister>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(event_capacity.max(1));
        let pool = BarrelPool::new(POOL_IDLE, move || {
            EventBarrel::new(max_number, cache_number, tx.clone())
        });
        Self {
            ctx,
            table: BarrelTable::new(pool),
            persister,
            status,
            events: Arc::new(Mutex::new(rx)),
            window_messages: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, message: SharedMessage) -> Result<EventInsert> {
        if message.event_id.is_empty() {
            self.ctx.metrics.dropped(STORE, "empty_id");
            return Err(EventLogError::InvalidMessage(
                "event message without event_id".to_string(),
            ));
        }

        let now = self.ctx.clock.now();
        let event_id = message.event_id.clone();
        let barrel = self
            .table
            .get_or_create(&event_id, |barrel| barrel.seed(&event_id, now));

        match barrel.insert(message, now) {
            Ok(EventInsert::Stored) => {
                self.window_messages.fetch_add(1, Ordering::Relaxed);
                self.ctx
                    .metrics
                    .store_messages
                    .with_label_values(&[STORE])
                    .inc();
                Ok(EventInsert::Stored)
            }
            Ok(EventInsert::Skipped) => Ok(EventInsert::Skipped),
            Err(e) => {
                tracing::warn!("Dropping message: {}", e);
                self.ctx.metrics.dropped(STORE, "over_cap");
                Err(e)
            }
        }
    }

    pub fn get(&self, event_id: &str) -> Option<Arc<EventBarrel>> {
        self.table.get(event_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub async fn handle_barrel_event(&self, event: BarrelEvent) {
        match event {
            BarrelEvent::Persistence(event_id) => {
                if let Some(barrel) = self.table.get(&event_id) {
                    if barrel.needs_persistence() {
                        self.flush(&barrel).await;
                    }
                }
            }
            BarrelEvent::Callback {
                event_id,
                status,
                message,
            } => self.status.on_callback(&event_id, &status, &message),
            BarrelEvent::CodeVersion { event_id, message } => {
                self.status.on_code_version(&event_id, &message)
            }
        }
    }

    async fn flush(&self, barrel: &EventBarrel) {
        let outcome = barrel.flush(self.persister.as_ref()).await;
        record_flush(&self.ctx, STORE, outcome);
    }

    /// Spawns the barrel-event workers. They share one receiver.
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

    /// Flushes and collects barrels idle for more than 30 s.
    pub async fn gc(&self) {
        let now = self.ctx.clock.now();
        let candidates = self.table.idle_candidates(now, event_idle(), false);
        let mut ids = Vec::with_capacity(candidates.len());
        for barrel in candidates {
            barrel.gc_persistence();
            self.flush(&barrel).await;
            ids.push(barrel.id().to_string());
        }

        for barrel in self.table.remove_idle(&ids, now, event_idle(), false) {
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

    /// Shutdown path: stages and flushes every live barrel.
    pub async fn flush_all(&self) {
        for barrel in self.table.snapshot() {
            barrel.gc_persistence();
            self.flush(&barrel).await;
        }
    }

    /// `(service_size, log_size_per_window)`; the window restarts at each GC.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::EventLogMessage;
    use crate::metrics::PipelineMetrics;
    use crate::persistence::EventFilePersister;
    use crate::status::LogStatusSink;
    use crate::store::garbage::GarbageQueue;
    use chrono::Utc;

    fn step(event_id: &str, step: &str) -> SharedMessage {
        Arc::new(EventLogMessage {
            event_id: event_id.to_string(),
            step: step.to_string(),
            status: "success".to_string(),
            message: format!("{} line", step),
            level: "info".to_string(),
            ..Default::default()
        })
    }

    fn store(home: &std::path::Path, clock: Arc<ManualClock>) -> (Arc<EventStore>, CancellationToken) {
        let token = CancellationToken::new();
        let (garbage, _worker) = GarbageQueue::new(
            home.join("garbage.log"),
            std::time::Duration::from_secs(10),
            8,
            token.clone(),
        );
        let ctx = StoreContext {
            clock: clock.clone(),
            metrics: PipelineMetrics::unregistered().unwrap(),
            garbage,
        };
        let persister = Arc::new(EventFilePersister::new(home, clock).unwrap());
        let store = EventStore::new(ctx, 1000, 100, 16, persister, Arc::new(LogStatusSink));
        (Arc::new(store), token)
    }

    #[tokio::test]
    async fn test_terminal_step_is_persisted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (store, token) = store(temp_dir.path(), clock);
        let tracker = TaskTracker::new();
        store.spawn_workers(1, &tracker, &token);

        store.insert(step("abc", "info")).unwrap();
        store.insert(step("abc", "progress")).unwrap();
        store.insert(step("abc", "last")).unwrap();

        let path = temp_dir.path().join("eventlog").join("abc.log");
        let mut lines = 0;
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(&path) {
                lines = content.lines().count();
                if lines == 2 {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(lines, 2);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_gc_flushes_and_collects_idle_barrels() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (store, _token) = store(temp_dir.path(), clock.clone());

        store.insert(step("idle", "info")).unwrap();
        assert_eq!(store.monitor_counts(), (1, 1));

        store.gc().await;
        assert_eq!(store.len(), 1);

        clock.advance(Duration::seconds(31));
        store.gc().await;
        assert!(store.is_empty());

        let content =
            std::fs::read_to_string(temp_dir.path().join("eventlog").join("idle.log")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_empty_event_id_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (store, _token) = store(temp_dir.path(), clock);
        assert!(store.insert(step("", "info")).is_err());
        assert!(store.is_empty());
    }
}
