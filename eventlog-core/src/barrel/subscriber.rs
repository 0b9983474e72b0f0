use super::SharedMessage;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Receiving half handed to the presentation layer.
#[derive(Debug)]
pub struct Subscription {
    pub sub_id: String,
    receiver: mpsc::Receiver<SharedMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SharedMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SharedMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<SharedMessage> {
        self.receiver
    }
}

/// Subscriber slots of one barrel. Only the set holds senders, so removing a
/// slot (or dropping the set) closes that subscriber's channel exactly once.
#[derive(Debug)]
pub struct SubscriberSet {
    capacity: usize,
    subs: HashMap<String, mpsc::Sender<SharedMessage>>,
}

impl SubscriberSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subs: HashMap::new(),
        }
    }

    /// Opens a channel for `sub_id`, first filling it with `backfill`.
    /// Re-subscribing with the same id closes the previous channel.
    pub fn add<'a>(
        &mut self,
        sub_id: &str,
        backfill: impl IntoIterator<Item = &'a SharedMessage>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        for message in backfill {
            if tx.try_send(message.clone()).is_err() {
                break;
            }
        }
        self.subs.insert(sub_id.to_string(), tx);
        Subscription {
            sub_id: sub_id.to_string(),
            receiver: rx,
        }
    }

    pub fn remove(&mut self, sub_id: &str) -> bool {
        self.subs.remove(sub_id).is_some()
    }

    /// Non-blocking fan-out. A full subscriber misses this message but is
    /// kept; a subscriber whose receiver is gone is removed. Returns the
    /// number of subscribers that missed the message.
    pub fn broadcast(&mut self, message: &SharedMessage) -> usize {
        let mut missed = 0;
        self.subs.retain(|sub_id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Subscriber {} is full, dropping message", sub_id);
                missed += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        missed
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn clear(&mut self) {
        self.subs.clear();
    }
}
