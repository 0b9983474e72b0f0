use crate::error::{EventLogError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default = "default_polling_timeout_secs")]
    pub polling_timeout_secs: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            cluster: ClusterConfig::default(),
            store: StoreConfig::default(),
            entry: EntryConfig::default(),
            web: WebConfig::default(),
            polling_timeout_secs: default_polling_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default = "default_any_ip")]
    pub pub_bind_ip: String,
    #[serde(default = "default_pub_port")]
    pub pub_bind_port: u16,
    #[serde(default = "default_discover_home")]
    pub discover_home: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default = "default_five")]
    pub peer_connect_timeout_secs: u64,
    #[serde(default = "default_five")]
    pub peer_retry_secs: u64,
    #[serde(default = "default_peer_health_secs")]
    pub peer_health_secs: u64,
    #[serde(default = "default_five")]
    pub distribution_health_secs: u64,
    #[serde(default = "default_instance_stale_secs")]
    pub instance_stale_secs: u64,
    #[serde(default = "default_five")]
    pub monitor_tick_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            host_ip: None,
            host_name: None,
            pub_bind_ip: default_any_ip(),
            pub_bind_port: default_pub_port(),
            discover_home: default_discover_home(),
            registry: RegistryConfig::default(),
            peer_connect_timeout_secs: default_five(),
            peer_retry_secs: default_five(),
            peer_health_secs: default_peer_health_secs(),
            distribution_health_secs: default_five(),
            instance_stale_secs: default_instance_stale_secs(),
            monitor_tick_secs: default_five(),
        }
    }
}

impl ClusterConfig {
    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }

    pub fn peer_retry(&self) -> Duration {
        Duration::from_secs(self.peer_retry_secs)
    }

    pub fn peer_health(&self) -> Duration {
        Duration::from_secs(self.peer_health_secs)
    }

    pub fn distribution_health(&self) -> Duration {
        Duration::from_secs(self.distribution_health_secs)
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_secs(self.monitor_tick_secs)
    }

    pub fn host_name_or_default(&self) -> String {
        self.host_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Coordination-store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub etcd: Option<EtcdConfig>,
    #[serde(default = "default_five")]
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Etcd,
            etcd: Some(EtcdConfig::default()),
            timeout_secs: default_five(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Etcd,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_persistence_length")]
    pub event_log_persistence_length: u64,
    #[serde(default = "default_event_max_log_number")]
    pub peer_event_max_log_number: u64,
    #[serde(default = "default_event_max_cache_log_number")]
    pub peer_event_max_cache_log_number: usize,
    #[serde(default = "default_docker_max_cache_log_number")]
    pub peer_docker_max_cache_log_number: usize,
    #[serde(default = "default_core_number")]
    pub handle_message_core_number: usize,
    #[serde(default = "default_core_number")]
    pub handle_docker_log_core_number: usize,
    #[serde(default = "default_core_number")]
    pub handle_sub_message_core_number: usize,
    #[serde(default = "default_core_number")]
    pub handle_monitor_message_core_number: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    #[serde(default = "default_garbage_file")]
    pub garbage_message_file: PathBuf,
    #[serde(default = "default_garbage_flush_secs")]
    pub garbage_flush_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    #[serde(default)]
    pub db: DbConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_log_persistence_length: default_persistence_length(),
            peer_event_max_log_number: default_event_max_log_number(),
            peer_event_max_cache_log_number: default_event_max_cache_log_number(),
            peer_docker_max_cache_log_number: default_docker_max_cache_log_number(),
            handle_message_core_number: default_core_number(),
            handle_docker_log_core_number: default_core_number(),
            handle_sub_message_core_number: default_core_number(),
            handle_monitor_message_core_number: default_core_number(),
            channel_capacity: default_channel_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            garbage_message_file: default_garbage_file(),
            garbage_flush_secs: default_garbage_flush_secs(),
            gc_interval_secs: default_gc_interval_secs(),
            db: DbConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn garbage_flush_interval(&self) -> Duration {
        Duration::from_secs(self.garbage_flush_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(rename = "type", default = "default_db_type")]
    pub db_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_home_path")]
    pub home_path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_type: default_db_type(),
            url: String::new(),
            home_path: default_home_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "default_event_log_server")]
    pub event_log_server: ListenConfig,
    #[serde(default)]
    pub docker_log_server: DockerLogServerConfig,
    #[serde(default = "default_new_monitor_server")]
    pub new_monitor_message_server: ListenConfig,
    #[serde(default = "default_monitor_server")]
    pub monitor_message_server: ListenConfig,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            event_log_server: default_event_log_server(),
            docker_log_server: DockerLogServerConfig::default(),
            new_monitor_message_server: default_new_monitor_server(),
            monitor_message_server: default_monitor_server(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_any_ip")]
    pub bind_ip: String,
    pub bind_port: u16,
}

impl ListenConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.bind_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerLogServerConfig {
    #[serde(default = "default_any_ip")]
    pub bind_ip: String,
    #[serde(default = "default_docker_port")]
    pub bind_port: u16,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for DockerLogServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_any_ip(),
            bind_port: default_docker_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl DockerLogServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.bind_port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Options of the presentation adapter; the HTTP surface binds `bind_ip:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_any_ip")]
    pub bind_ip: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_any_ip(),
            port: default_web_port(),
            timeout_secs: default_web_timeout_secs(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
        }
    }
}

impl WebConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}

fn default_true() -> bool {
    true
}

fn default_five() -> u64 {
    5
}

fn default_any_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_pub_port() -> u16 {
    6365
}

fn default_docker_port() -> u16 {
    6362
}

fn default_web_port() -> u16 {
    6363
}

fn default_discover_home() -> String {
    "/rainbond/eventlog".to_string()
}

fn default_peer_health_secs() -> u64 {
    120
}

fn default_instance_stale_secs() -> u64 {
    10
}

fn default_polling_timeout_secs() -> u64 {
    1
}

fn default_persistence_length() -> u64 {
    128
}

fn default_event_max_log_number() -> u64 {
    1_000_000
}

fn default_event_max_cache_log_number() -> usize {
    100
}

fn default_docker_max_cache_log_number() -> usize {
    1000
}

fn default_core_number() -> usize {
    2
}

fn default_channel_capacity() -> usize {
    2048
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_garbage_file() -> PathBuf {
    PathBuf::from("/var/log/eventlog_garbage_message.log")
}

fn default_garbage_flush_secs() -> u64 {
    10
}

fn default_gc_interval_secs() -> u64 {
    30
}

fn default_db_type() -> String {
    "file".to_string()
}

fn default_home_path() -> PathBuf {
    PathBuf::from("/grdata/logs")
}

fn default_idle_timeout_secs() -> u64 {
    15
}

fn default_web_timeout_secs() -> u64 {
    60
}

fn default_buffer_size() -> usize {
    4096
}

fn default_event_log_server() -> ListenConfig {
    ListenConfig {
        enabled: true,
        bind_ip: default_any_ip(),
        bind_port: 6367,
    }
}

fn default_new_monitor_server() -> ListenConfig {
    ListenConfig {
        enabled: true,
        bind_ip: default_any_ip(),
        bind_port: 6166,
    }
}

fn default_monitor_server() -> ListenConfig {
    ListenConfig {
        enabled: false,
        bind_ip: default_any_ip(),
        bind_port: 6167,
    }
}

impl EventLogConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("EVENTLOG").separator("__"))
            .build()?;

        let config: EventLogConfig = settings.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.discover_home.trim().is_empty() {
            return Err(EventLogError::Config(
                "cluster.discover_home cannot be empty".to_string(),
            ));
        }

        if self.store.db.db_type != "file" {
            return Err(EventLogError::Config(format!(
                "unsupported store.db.type '{}': expected file",
                self.store.db.db_type
            )));
        }

        if self.store.peer_event_max_cache_log_number == 0
            || self.store.peer_docker_max_cache_log_number == 0
            || self.store.peer_event_max_log_number == 0
        {
            return Err(EventLogError::Config(
                "store thresholds must be greater than zero".to_string(),
            ));
        }

        let cores = [
            self.store.handle_message_core_number,
            self.store.handle_docker_log_core_number,
            self.store.handle_sub_message_core_number,
            self.store.handle_monitor_message_core_number,
        ];
        if cores.iter().any(|cores| *cores == 0) {
            return Err(EventLogError::Config(
                "handle_*_core_number must be at least 1".to_string(),
            ));
        }

        if self.store.channel_capacity == 0 || self.store.subscriber_capacity == 0 {
            return Err(EventLogError::Config(
                "channel capacities must be greater than zero".to_string(),
            ));
        }

        let periods = [
            ("store.gc_interval_secs", self.store.gc_interval_secs),
            ("store.garbage_flush_secs", self.store.garbage_flush_secs),
            ("cluster.monitor_tick_secs", self.cluster.monitor_tick_secs),
            ("cluster.distribution_health_secs", self.cluster.distribution_health_secs),
            ("cluster.peer_health_secs", self.cluster.peer_health_secs),
            ("cluster.peer_retry_secs", self.cluster.peer_retry_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            return Err(EventLogError::Config(format!(
                "{} must be greater than zero",
                name
            )));
        }

        if self.cluster.registry.backend == RegistryBackend::Etcd
            && self
                .cluster
                .registry
                .etcd
                .as_ref()
                .is_none_or(|etcd| etcd.endpoints.is_empty())
        {
            return Err(EventLogError::Config(
                "etcd endpoints are required for etcd backend".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_applies_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "cluster:\n  discover_home: /test/eventlog\n  registry:\n    backend: memory\nstore:\n  peer_event_max_cache_log_number: 10\n  db:\n    home_path: /tmp/logs\n"
        )
        .unwrap();

        let config = EventLogConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.cluster.discover_home, "/test/eventlog");
        assert_eq!(config.cluster.registry.backend, RegistryBackend::Memory);
        assert_eq!(config.store.peer_event_max_cache_log_number, 10);
        assert_eq!(config.store.peer_docker_max_cache_log_number, 1000);
        assert_eq!(config.store.db.home_path, PathBuf::from("/tmp/logs"));
        assert_eq!(config.entry.docker_log_server.bind_port, 6362);
        assert!(!config.entry.monitor_message_server.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let mut config = EventLogConfig::default();
        config.store.gc_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EventLogError::Config(ref msg) if msg.contains("gc_interval_secs")));

        let mut config = EventLogConfig::default();
        config.cluster.monitor_tick_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EventLogError::Config(ref msg) if msg.contains("monitor_tick_secs")));

        let mut config = EventLogConfig::default();
        config.cluster.peer_health_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_db_type() {
        let mut config = EventLogConfig::default();
        config.store.db.db_type = "mysql".to_string();
        assert!(matches!(config.validate(), Err(EventLogError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = EventLogConfig::default();
        config.store.handle_message_core_number = 0;
        assert!(config.validate().is_err());
    }
}
