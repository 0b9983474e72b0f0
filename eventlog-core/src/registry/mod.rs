//! Coordination store access.
//!
//! Keys handed to a [`Registry`] are relative to its namespace (the
//! configured discover home), e.g. `instance/10.0.0.1:6365`. Watch events
//! carry relative keys as well.

pub mod etcd;
pub mod factory;
pub mod memory;

pub use etcd::EtcdRegistry;
pub use factory::RegistryBuilder;
pub use memory::MemoryRegistry;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every `(key, value)` under `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Streams changes under `prefix` until the receiver is dropped.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>>;
}

pub(crate) fn join_key(namespace: &str, key: &str) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), key.trim_start_matches('/'))
}

pub(crate) fn strip_namespace<'a>(namespace: &str, key: &'a str) -> &'a str {
    let namespace = namespace.trim_end_matches('/');
    key.strip_prefix(namespace)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_keys() {
        assert_eq!(
            join_key("/rainbond/eventlog/", "instance/a:1"),
            "/rainbond/eventlog/instance/a:1"
        );
        assert_eq!(
            strip_namespace("/rainbond/eventlog", "/rainbond/eventlog/instance/a:1"),
            "instance/a:1"
        );
        assert_eq!(strip_namespace("/other", "/rainbond/x"), "/rainbond/x");
    }
}
