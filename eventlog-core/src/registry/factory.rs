use super::{EtcdRegistry, MemoryRegistry, Registry};
use crate::config::{RegistryBackend, RegistryConfig};
use crate::error::{EventLogError, Result};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects the coordination store every node shares. Instance records,
/// distribution records and monitor data all live under `discover_home`.
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    backend: RegistryBackend,
    discover_home: String,
    etcd_endpoints: Vec<String>,
    timeout: Duration,
}

impl RegistryBuilder {
    pub fn new(backend: RegistryBackend, discover_home: impl Into<String>) -> Self {
        Self {
            backend,
            discover_home: discover_home.into(),
            etcd_endpoints: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Seeds the builder from the `cluster.registry` section.
    pub fn from_config(config: &RegistryConfig, discover_home: &str) -> Self {
        let mut builder = Self::new(config.backend, discover_home)
            .timeout(Duration::from_secs(config.timeout_secs));
        if let Some(etcd) = &config.etcd {
            builder = builder.etcd_endpoints(etcd.endpoints.clone());
        }
        builder
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = endpoints;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `/rainbond/eventlog/` and `rainbond/eventlog` both become
    /// `/rainbond/eventlog`, so record keys never carry a double slash.
    fn discover_home(&self) -> Result<String> {
        let home = self.discover_home.trim().trim_matches('/');
        if home.is_empty() {
            return Err(EventLogError::Config(
                "cluster.discover_home cannot be empty".to_string(),
            ));
        }
        Ok(format!("/{}", home))
    }

    pub async fn build(&self) -> Result<Arc<dyn Registry>> {
        let home = self.discover_home()?;

        match self.backend {
            RegistryBackend::Etcd => {
                let endpoints: Vec<String> = self
                    .etcd_endpoints
                    .iter()
                    .map(|endpoint| endpoint.trim().to_string())
                    .filter(|endpoint| !endpoint.is_empty())
                    .collect();
                if endpoints.is_empty() {
                    return Err(EventLogError::Config(
                        "etcd endpoints are required for etcd backend".to_string(),
                    ));
                }
                tracing::info!("Connecting to etcd {:?} under {}", endpoints, home);
                let registry = EtcdRegistry::new(&endpoints, &home, self.timeout).await?;
                Ok(Arc::new(registry))
            }
            RegistryBackend::Memory => {
                tracing::warn!("Using in-process registry under {}; peers cannot join", home);
                Ok(Arc::new(MemoryRegistry::new(&home)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_normalizes_home() {
        let registry = RegistryBuilder::new(RegistryBackend::Memory, "rainbond/eventlog/")
            .build()
            .await
            .unwrap();
        registry.put("instance/a", b"x").await.unwrap();
        assert!(registry.get("instance/a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_bad_settings() {
        assert!(
            RegistryBuilder::new(RegistryBackend::Memory, " / ")
                .build()
                .await
                .is_err()
        );
        assert!(
            RegistryBuilder::new(RegistryBackend::Etcd, "/rainbond/eventlog")
                .etcd_endpoints(vec![" ".to_string()])
                .build()
                .await
                .is_err()
        );
    }

    #[test]
    fn test_from_config() {
        let config = RegistryConfig::default();
        let builder = RegistryBuilder::from_config(&config, "/rainbond/eventlog/");
        assert_eq!(builder.backend, RegistryBackend::Etcd);
        assert_eq!(builder.discover_home().unwrap(), "/rainbond/eventlog");
        assert_eq!(builder.etcd_endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(builder.timeout, Duration::from_secs(5));
    }
}
