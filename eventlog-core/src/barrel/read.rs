use super::{Barrel, Poolable, SharedMessage, SubscriberSet, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug)]
struct ReadState {
    cache: VecDeque<SharedMessage>,
    subs: SubscriberSet,
    update_time: DateTime<Utc>,
}

/// Live relay barrel: no persistence, keeps a bounded cache so late
/// subscribers see what already happened.
pub struct ReadBarrel {
    id: String,
    cache_limit: usize,
    inner: Mutex<ReadState>,
}

impl ReadBarrel {
    pub fn new(cache_limit: usize, subscriber_capacity: usize) -> Self {
        Self {
            id: String::new(),
            cache_limit,
            inner: Mutex::new(ReadState {
                cache: VecDeque::new(),
                subs: SubscriberSet::new(subscriber_capacity),
                update_time: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }

    pub(crate) fn seed(&mut self, id: &str, now: DateTime<Utc>) {
        self.id = id.to_string();
        self.inner.get_mut().update_time = now;
    }

    /// Returns how many subscribers missed the message.
    pub fn insert(&self, message: SharedMessage, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        inner.update_time = now;
        if self.cache_limit > 0 {
            if inner.cache.len() >= self.cache_limit {
                inner.cache.pop_front();
            }
            inner.cache.push_back(message.clone());
        }
        inner.subs.broadcast(&message)
    }

    /// Registers `sub_id` after replaying the cache into its channel. Both
    /// happen under the barrel lock so nothing is seen twice or skipped.
    pub fn subscribe(&self, sub_id: &str) -> Subscription {
        let mut inner = self.inner.lock();
        let ReadState { cache, subs, .. } = &mut *inner;
        subs.add(sub_id, cache.iter())
    }

    pub fn del_sub_chan(&self, sub_id: &str) -> bool {
        self.inner.lock().subs.remove(sub_id)
    }

    pub fn cached(&self) -> usize {
        self.inner.lock().cache.len()
    }
}

impl Poolable for ReadBarrel {
    fn reset(&mut self) {
        self.id.clear();
        let inner = self.inner.get_mut();
        inner.cache.clear();
        inner.subs.clear();
        inner.update_time = DateTime::<Utc>::MIN_UTC;
    }
}

impl Barrel for ReadBarrel {
    fn id(&self) -> &str {
        &self.id
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventLogMessage;
    use std::sync::Arc;

    fn msg(text: &str) -> SharedMessage {
        Arc::new(EventLogMessage {
            event_id: "abc".to_string(),
            message: text.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_new_subscriber_replays_cache() {
        let mut barrel = ReadBarrel::new(2, 16);
        barrel.seed("abc", Utc::now());
        barrel.insert(msg("a"), Utc::now());
        barrel.insert(msg("b"), Utc::now());
        barrel.insert(msg("c"), Utc::now());
        assert_eq!(barrel.cached(), 2);

        let mut sub = barrel.subscribe("s1");
        barrel.insert(msg("d"), Utc::now());

        let seen: Vec<String> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .iter()
        .map(|m| m.message.clone())
        .collect();
        assert_eq!(seen, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_close_subscribers_on_gc() {
        let barrel = ReadBarrel::new(0, 4);
        let mut sub = barrel.subscribe("s1");
        barrel.close_subscribers();
        assert!(sub.recv().await.is_none());
    }
}
