use super::{Registry, WatchEvent, join_key, strip_namespace};
use crate::error::{EventLogError, Result};
use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, WatchOptions};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

const WATCH_BUFFER: usize = 1024;
const REWATCH_DELAY: Duration = Duration::from_secs(5);

pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    timeout: Duration,
}

impl EtcdRegistry {
    pub async fn new(endpoints: &[String], namespace: &str, timeout: Duration) -> Result<Self> {
        let client = tokio::time::timeout(timeout, Client::connect(endpoints, None))
            .await
            .map_err(|_| {
                EventLogError::Registry(format!("connect to etcd {:?} timed out", endpoints))
            })??;
        tracing::info!("Connected to etcd at {:?}", endpoints);

        Ok(Self {
            client,
            namespace: namespace.to_string(),
            timeout,
        })
    }

    fn key(&self, key: &str) -> String {
        join_key(&self.namespace, key)
    }

    async fn timed<T>(
        &self,
        op: &str,
        fut: impl Future<Output = std::result::Result<T, etcd_client::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EventLogError::Registry(format!("etcd {} timed out", op))),
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let response = self.timed("get", client.get(self.key(key), None)).await?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix();
        let response = self
            .timed("get", client.get(self.key(prefix), Some(options)))
            .await?;

        let mut entries = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = kv.key_str()?;
            entries.push((
                strip_namespace(&self.namespace, key).to_string(),
                kv.value().to_vec(),
            ));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        self.timed("put", client.put(self.key(key), value.to_vec(), None))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let response = self
            .timed("delete", client.delete(self.key(key), None))
            .await?;
        Ok(response.deleted() > 0)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let client = self.client.clone();
        let full = self.key(prefix);
        let namespace = self.namespace.clone();

        tokio::spawn(async move {
            while !tx.is_closed() {
                if let Err(e) = watch_once(client.clone(), &full, &namespace, &tx).await {
                    tracing::warn!("Watch on {} failed: {}, retrying", full, e);
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(REWATCH_DELAY) => {}
                }
            }
            tracing::debug!("Watch on {} stopped", full);
        });

        Ok(rx)
    }
}

async fn watch_once(
    mut client: Client,
    prefix: &str,
    namespace: &str,
    tx: &mpsc::Sender<WatchEvent>,
) -> Result<()> {
    let (_watcher, mut stream) = client
        .watch(prefix, Some(WatchOptions::new().with_prefix()))
        .await?;

    loop {
        let response = tokio::select! {
            _ = tx.closed() => return Ok(()),
            response = stream.message() => response?,
        };
        let Some(response) = response else {
            return Err(EventLogError::Registry("watch stream ended".to_string()));
        };

        for event in response.events() {
            let Some(kv) = event.kv() else { continue };
            let key = strip_namespace(namespace, kv.key_str()?).to_string();
            let change = match event.event_type() {
                EventType::Put => WatchEvent::Put {
                    key,
                    value: kv.value().to_vec(),
                },
                EventType::Delete => WatchEvent::Delete { key },
            };
            if tx.send(change).await.is_err() {
                return Ok(());
            }
        }
    }
}
