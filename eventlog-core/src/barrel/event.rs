use super::{
    Barrel, BarrelEvent, FlushOutcome, PersistBuffer, Poolable, SharedMessage, emit, flush_staged,
};
use crate::error::{EventLogError, Result};
use crate::message::STEP_CODE_VERSION;
use crate::persistence::MessagePersister;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug)]
struct EventState {
    buffer: PersistBuffer,
    size: u64,
    update_time: DateTime<Utc>,
    is_callback: bool,
}

impl EventState {
    fn new() -> Self {
        Self {
            buffer: PersistBuffer::default(),
            size: 0,
            update_time: DateTime::<Utc>::MIN_UTC,
            is_callback: false,
        }
    }
}

/// Operation-log barrel: short lived, flushed on size or on a terminal step.
pub struct EventBarrel {
    event_id: String,
    max_number: u64,
    cache_number: usize,
    events: mpsc::Sender<BarrelEvent>,
    state: Mutex<EventState>,
    flush_lock: tokio::sync::Mutex<()>,
}

/// What happened to an inserted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInsert {
    Stored,
    /// `progress` steps are never stored.
    Skipped,
}

impl EventBarrel {
    pub fn new(max_number: u64, cache_number: usize, events: mpsc::Sender<BarrelEvent>) -> Self {
        Self {
            event_id: String::new(),
            max_number,
            cache_number: cache_number.max(1),
            events,
            state: Mutex::new(EventState::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn seed(&mut self, event_id: &str, now: DateTime<Utc>) {
        self.event_id = event_id.to_string();
        self.state.get_mut().update_time = now;
    }

    pub fn insert(&self, message: SharedMessage, now: DateTime<Utc>) -> Result<EventInsert> {
        let mut state = self.state.lock();
        if state.size > self.max_number {
            return Err(EventLogError::OverCap {
                event_id: self.event_id.clone(),
                max_number: self.max_number,
            });
        }
        if message.is_progress() {
            return Ok(EventInsert::Skipped);
        }

        state.buffer.push(message.clone());
        state.size += 1;
        state.update_time = now;

        if message.is_terminal() {
            state.is_callback = true;
            state.buffer.stage();
            emit(
                &self.events,
                BarrelEvent::Callback {
                    event_id: self.event_id.clone(),
                    status: message.status.clone(),
                    message: message.message.clone(),
                },
            );
            emit(&self.events, BarrelEvent::Persistence(self.event_id.clone()));
            return Ok(EventInsert::Stored);
        }

        if message.step == STEP_CODE_VERSION {
            emit(
                &self.events,
                BarrelEvent::CodeVersion {
                    event_id: self.event_id.clone(),
                    message: message.message.clone(),
                },
            );
        }

        if state.buffer.hot_len() >= self.cache_number {
            state.buffer.stage();
            emit(&self.events, BarrelEvent::Persistence(self.event_id.clone()));
        }

        Ok(EventInsert::Stored)
    }

    /// Moves everything in the hot buffer into staging.
    pub fn gc_persistence(&self) {
        self.state.lock().buffer.stage();
    }

    pub fn needs_persistence(&self) -> bool {
        self.state.lock().buffer.staging_len() > 0
    }

    pub fn is_callback(&self) -> bool {
        self.state.lock().is_callback
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.buffer.hot_len(), state.buffer.staging_len())
    }

    /// Drives staged messages into `persister`. Serialized per barrel, so a
    /// successful flush covers everything staged before it started.
    pub async fn flush(&self, persister: &dyn MessagePersister) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;
        let staged = self.state.lock().buffer.take_staging();
        flush_staged(&self.event_id, staged, persister).await
    }
}

impl Poolable for EventBarrel {
    fn reset(&mut self) {
        self.event_id.clear();
        *self.state.get_mut() = EventState::new();
    }
}

impl Barrel for EventBarrel {
    fn id(&self) -> &str {
        &self.event_id
    }

    fn update_time(&self) -> DateTime<Utc> {
        self.state.lock().update_time
    }
}
