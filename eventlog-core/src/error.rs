use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventLogError>;

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Barrel {event_id} is over capacity ({max_number} messages)")]
    OverCap { event_id: String, max_number: u64 },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("No progress after {0} consecutive empty reads")]
    NoProgress(usize),

    #[error("Unknown subscription kind: {0}")]
    UnknownKind(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<etcd_client::Error> for EventLogError {
    fn from(error: etcd_client::Error) -> Self {
        EventLogError::Registry(error.to_string())
    }
}

impl From<::config::ConfigError> for EventLogError {
    fn from(error: ::config::ConfigError) -> Self {
        EventLogError::Config(error.to_string())
    }
}
