use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Routes items to a fixed set of workers by key hash, so everything for one
/// producer id is handled by the same worker in arrival order.
pub struct ShardRouter<T> {
    senders: Vec<mpsc::Sender<T>>,
}

impl<T: Send + 'static> ShardRouter<T> {
    /// Spawns `workers` tasks on `tracker`, each calling `handler` for its
    /// share of the items. On cancellation a worker handles what is already
    /// queued and exits.
    pub fn spawn<F>(
        name: &'static str,
        workers: usize,
        capacity: usize,
        tracker: &TaskTracker,
        token: &CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut senders = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
            senders.push(tx);

            let handler = handler.clone();
            let token = token.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        item = rx.recv() => match item {
                            Some(item) => handler(item),
                            None => return,
                        },
                    }
                }
                rx.close();
                while let Ok(item) = rx.try_recv() {
                    handler(item);
                }
                tracing::debug!("{} worker {} stopped", name, index);
            });
        }
        Self { senders }
    }

    pub fn shard_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Waits for room on the owning worker's queue. Returns false once the
    /// worker has gone away.
    pub async fn route(&self, key: &str, item: T) -> bool {
        let shard = self.shard_of(key);
        self.senders[shard].send(item).await.is_ok()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }
}
