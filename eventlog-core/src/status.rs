//! Collaborator notified of terminal and code-version steps.

/// Receives operation status changes raised by event barrels.
pub trait StatusSink: Send + Sync {
    fn on_callback(&self, event_id: &str, status: &str, message: &str);

    fn on_code_version(&self, event_id: &str, message: &str);
}

/// Default sink: records status changes in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn on_callback(&self, event_id: &str, status: &str, message: &str) {
        tracing::info!(
            "Event {} finished with status {}: {}",
            event_id,
            status,
            message
        );
    }

    fn on_code_version(&self, event_id: &str, message: &str) {
        tracing::info!("Event {} reported code version {}", event_id, message);
    }
}
