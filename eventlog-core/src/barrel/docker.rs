use super::{
    Barrel, BarrelEvent, FlushOutcome, PersistBuffer, Poolable, SharedMessage, SubscriberSet,
    Subscription, emit, flush_staged,
};
use crate::clock::is_older_than;
use crate::persistence::MessagePersister;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Staged container logs older than this are flushed even below `cache_size`.
pub fn persistence_interval() -> Duration {
    Duration::minutes(1)
}

#[derive(Debug)]
struct DockerState {
    buffer: PersistBuffer,
    size: u64,
    update_time: DateTime<Utc>,
    persistence_time: DateTime<Utc>,
}

impl DockerState {
    fn new() -> Self {
        Self {
            buffer: PersistBuffer::default(),
            size: 0,
            update_time: DateTime::<Utc>::MIN_UTC,
            persistence_time: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Container stdout barrel. Subscribers are primary; persistence trails.
pub struct DockerLogBarrel {
    service_id: String,
    cache_size: usize,
    events: mpsc::Sender<BarrelEvent>,
    subs: Mutex<SubscriberSet>,
    state: Mutex<DockerState>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl DockerLogBarrel {
    pub fn new(
        cache_size: usize,
        subscriber_capacity: usize,
        events: mpsc::Sender<BarrelEvent>,
    ) -> Self {
        Self {
            service_id: String::new(),
            cache_size: cache_size.max(1),
            events,
            subs: Mutex::new(SubscriberSet::new(subscriber_capacity)),
            state: Mutex::new(DockerState::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn seed(&mut self, service_id: &str, now: DateTime<Utc>) {
        self.service_id = service_id.to_string();
        let state = self.state.get_mut();
        state.update_time = now;
        state.persistence_time = now;
    }

    /// Fans the line out, then buffers it for persistence. Returns how many
    /// subscribers missed it.
    pub fn insert(&self, message: SharedMessage, now: DateTime<Utc>) -> usize {
        let missed = self.subs.lock().broadcast(&message);

        let mut state = self.state.lock();
        state.buffer.push(message);
        state.size += 1;
        state.update_time = now;

        let stale = is_older_than(now, state.persistence_time, persistence_interval());
        if state.buffer.hot_len() >= self.cache_size || stale {
            state.buffer.stage();
            state.persistence_time = now;
            emit(&self.events, BarrelEvent::Persistence(self.service_id.clone()));
        }

        missed
    }

    /// Timer path: stages a non-empty hot buffer whose last persistence is
    /// more than a minute old.
    pub fn stage_if_stale(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.buffer.hot_len() == 0
            || !is_older_than(now, state.persistence_time, persistence_interval())
        {
            return false;
        }
        state.buffer.stage();
        state.persistence_time = now;
        true
    }

    pub fn gc_persistence(&self) {
        self.state.lock().buffer.stage();
    }

    pub fn needs_persistence(&self) -> bool {
        self.state.lock().buffer.staging_len() > 0
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn subscribe(&self, sub_id: &str) -> Subscription {
        self.subs.lock().add(sub_id, [])
    }

    pub fn del_sub_chan(&self, sub_id: &str) -> bool {
        self.subs.lock().remove(sub_id)
    }

    pub async fn flush(&self, persister: &dyn MessagePersister) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;
        let staged = self.state.lock().buffer.take_staging();
        flush_staged(&self.service_id, staged, persister).await
    }
}

impl Poolable for DockerLogBarrel {
    fn reset(&mut self) {
        self.service_id.clear();
        self.subs.get_mut().clear();
        *self.state.get_mut() = DockerState::new();
    }
}

impl Barrel for DockerLogBarrel {
    fn id(&self) -> &str {
        &self.service_id
    }

    fn update_time(&self) -> DateTime<Utc> {
        self.state.lock().update_time
    }

    fn subscriber_count(&self) -> usize {
        self.subs.lock().len()
    }

    fn close_subscribers(&self) {
        self.subs.lock().clear();
    }
}
