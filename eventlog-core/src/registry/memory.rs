use super::{Registry, WatchEvent, join_key, strip_namespace};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const WATCH_BUFFER: usize = 1024;

struct Shared {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    changes: broadcast::Sender<WatchEvent>,
}

/// In-process registry. Clones share the same data, so several nodes in one
/// process see each other.
#[derive(Clone)]
pub struct MemoryRegistry {
    namespace: String,
    shared: Arc<Shared>,
}

impl MemoryRegistry {
    pub fn new(namespace: &str) -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            namespace: namespace.to_string(),
            shared: Arc::new(Shared {
                data: Mutex::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    fn key(&self, key: &str) -> String {
        join_key(&self.namespace, key)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.shared.data.lock().get(&self.key(key)).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let full = self.key(prefix);
        let data = self.shared.data.lock();
        Ok(data
            .range(full.clone()..)
            .take_while(|(key, _)| key.starts_with(&full))
            .map(|(key, value)| {
                (
                    strip_namespace(&self.namespace, key).to_string(),
                    value.clone(),
                )
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let full = self.key(key);
        self.shared.data.lock().insert(full.clone(), value.to_vec());
        let _ = self.shared.changes.send(WatchEvent::Put {
            key: full,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full = self.key(key);
        let existed = self.shared.data.lock().remove(&full).is_some();
        if existed {
            let _ = self.shared.changes.send(WatchEvent::Delete { key: full });
        }
        Ok(existed)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let full = self.key(prefix);
        let namespace = self.namespace.clone();
        let mut changes = self.shared.changes.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = changes.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Memory registry watcher lagged by {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let relative = match &event {
                    WatchEvent::Put { key, value } if key.starts_with(&full) => WatchEvent::Put {
                        key: strip_namespace(&namespace, key).to_string(),
                        value: value.clone(),
                    },
                    WatchEvent::Delete { key } if key.starts_with(&full) => WatchEvent::Delete {
                        key: strip_namespace(&namespace, key).to_string(),
                    },
                    _ => continue,
                };
                if tx.send(relative).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let registry = MemoryRegistry::new("/home");
        registry.put("instance/a", b"1").await.unwrap();
        registry.put("instance/b", b"2").await.unwrap();
        registry.put("owner/x", b"a").await.unwrap();

        assert_eq!(registry.get("instance/a").await.unwrap(), Some(b"1".to_vec()));
        let all = registry.get_prefix("instance/").await.unwrap();
        assert_eq!(
            all,
            vec![
                ("instance/a".to_string(), b"1".to_vec()),
                ("instance/b".to_string(), b"2".to_vec()),
            ]
        );

        assert!(registry.delete("instance/a").await.unwrap());
        assert!(!registry.delete("instance/a").await.unwrap());
        assert_eq!(registry.get("instance/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_watchers() {
        let first = MemoryRegistry::new("/home");
        let second = first.clone();
        let mut watch = first.watch_prefix("instance/").await.unwrap();

        second.put("owner/x", b"ignored").await.unwrap();
        second.put("instance/b", b"2").await.unwrap();
        second.delete("instance/b").await.unwrap();

        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::Put {
                key: "instance/b".to_string(),
                value: b"2".to_vec()
            }
        );
        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::Delete {
                key: "instance/b".to_string()
            }
        );
    }
}
