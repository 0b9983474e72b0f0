use super::MessagePersister;
use crate::clock::SharedClock;
use crate::error::{EventLogError, Result};
use crate::message::{EventLogMessage, check_level};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Writes operation logs to `<home>/eventlog/<event_id>.log`, one line per
/// message: `<level-flag> <unix-seconds> <message>`.
pub struct EventFilePersister {
    base_path: PathBuf,
    clock: SharedClock,
    // last written timestamp per event, so files never go back in time
    last_seen: Mutex<HashMap<String, i64>>,
}

impl EventFilePersister {
    pub fn new(home_path: &Path, clock: SharedClock) -> Result<Self> {
        let base_path = home_path.join("eventlog");
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            clock,
            last_seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn event_path(&self, event_id: &str) -> PathBuf {
        event_log_path(&self.base_path, event_id)
    }

    fn render(&self, event_id: &str, messages: &[Arc<EventLogMessage>]) -> String {
        let mut last_seen = self.last_seen.lock();
        let mut last = last_seen.get(event_id).copied();

        let mut out = String::new();
        for message in messages {
            // A message keeps its own time; only a missing one borrows the
            // previous line's, or the clock for the first line of an event.
            let stamp = match (parse_time(&message.time), last) {
                (Some(ts), Some(prev)) => ts.max(prev),
                (Some(ts), None) => ts,
                (None, Some(prev)) => prev,
                (None, None) => self.clock.now().timestamp(),
            };
            last = Some(stamp);
            out.push(message.level_flag());
            out.push(' ');
            out.push_str(&stamp.to_string());
            out.push(' ');
            out.push_str(&message.message);
            out.push('\n');
        }

        if let Some(stamp) = last {
            last_seen.insert(event_id.to_string(), stamp);
        }
        out
    }
}

#[async_trait]
impl MessagePersister for EventFilePersister {
    fn name(&self) -> &'static str {
        "event_file"
    }

    async fn save(&self, event_id: &str, messages: &[Arc<EventLogMessage>]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        validate_id(event_id)?;

        let body = self.render(event_id, messages);
        let path = self.event_path(event_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(
            "Persisted {} lines for event {} to {:?}",
            messages.len(),
            event_id,
            path
        );
        Ok(())
    }

    fn release(&self, event_id: &str) {
        self.last_seen.lock().remove(event_id);
    }
}

/// A parsed line of an event log file.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EventLogLine {
    pub level: String,
    pub time: String,
    pub message: String,
}

/// Streams `<base>/<event_id>.log`, keeping lines whose flag passes
/// `check_level(flag, level)`.
pub async fn read_event_log(base_path: &Path, event_id: &str, level: &str) -> Result<Vec<EventLogLine>> {
    validate_id(event_id)?;
    let path = event_log_path(base_path, event_id);
    let file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut lines = BufReader::new(file).lines();
    let mut result = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.splitn(3, ' ');
        let (Some(flag), Some(ts)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !check_level(flag, level) {
            continue;
        }

        let time = ts
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        result.push(EventLogLine {
            level: flag_to_level(flag).to_string(),
            time,
            message: parts.next().unwrap_or_default().to_string(),
        });
    }

    Ok(result)
}

fn event_log_path(base_path: &Path, event_id: &str) -> PathBuf {
    base_path.join(format!("{}.log", event_id))
}

fn flag_to_level(flag: &str) -> &'static str {
    match flag {
        "1" => "info",
        "2" => "debug",
        _ => "error",
    }
}

fn parse_time(time: &str) -> Option<i64> {
    if time.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(time)
        .ok()
        .map(|t| t.timestamp())
}

pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        return Err(EventLogError::InvalidMessage(format!(
            "invalid producer id: {:?}",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn message(level: &str, time: &str, text: &str) -> Arc<EventLogMessage> {
        Arc::new(EventLogMessage {
            event_id: "abc".to_string(),
            level: level.to_string(),
            time: time.to_string(),
            message: text.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_event_file_lines_and_levels() {
        let temp_dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let persister = EventFilePersister::new(temp_dir.path(), clock).unwrap();

        let batch = vec![
            message("info", "2024-03-01T12:00:10Z", "pulling image"),
            message("debug", "", "layer 1"),
            message("error", "2024-03-01T12:00:05Z", "retrying"),
            message("verbose", "2024-03-01T12:00:20Z", "odd level"),
        ];
        persister.save("abc", &batch).await.unwrap();

        let content = std::fs::read_to_string(persister.event_path("abc")).unwrap();
        let base = start.timestamp();
        let expected = format!(
            "1 {} pulling image\n2 {} layer 1\n0 {} retrying\n0 {} odd level\n",
            base + 10,
            base + 10,
            base + 10,
            base + 20
        );
        assert_eq!(content, expected);

        let errors = read_event_log(persister.base_path(), "abc", "error").await.unwrap();
        assert_eq!(errors.len(), 2);
        let infos = read_event_log(persister.base_path(), "abc", "info").await.unwrap();
        assert_eq!(infos.len(), 3);
        let debug = read_event_log(persister.base_path(), "abc", "debug").await.unwrap();
        assert_eq!(debug.len(), 4);
        assert_eq!(debug[1].level, "debug");
        assert_eq!(debug[0].message, "pulling image");
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease_across_batches() {
        let temp_dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let persister =
            EventFilePersister::new(temp_dir.path(), Arc::new(ManualClock::new(start))).unwrap();

        persister
            .save("abc", &[message("info", "2024-03-01T12:01:00Z", "a")])
            .await
            .unwrap();
        persister
            .save("abc", &[message("info", "2024-03-01T11:00:00Z", "b"), message("info", "", "c")])
            .await
            .unwrap();

        let content = std::fs::read_to_string(persister.event_path("abc")).unwrap();
        let stamps: Vec<i64> = content
            .lines()
            .map(|line| line.split(' ').nth(1).unwrap().parse().unwrap())
            .collect();
        assert_eq!(stamps.len(), 3);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_message_time_kept_when_flush_runs_late() {
        let temp_dir = tempfile::tempdir().unwrap();
        let produced = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(produced));
        clock.advance(Duration::seconds(30));
        let persister = EventFilePersister::new(temp_dir.path(), clock).unwrap();

        persister
            .save("abc", &[message("info", "2024-03-01T12:00:00Z", "hello")])
            .await
            .unwrap();
        persister
            .save("late", &[message("info", "", "no time")])
            .await
            .unwrap();

        let content = std::fs::read_to_string(persister.event_path("abc")).unwrap();
        assert_eq!(content, format!("1 {} hello\n", produced.timestamp()));
        let content = std::fs::read_to_string(persister.event_path("late")).unwrap();
        assert_eq!(content, format!("1 {} no time\n", produced.timestamp() + 30));
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let lines = read_event_log(temp_dir.path(), "nothing", "debug").await.unwrap();
        assert!(lines.is_empty());
        assert!(read_event_log(temp_dir.path(), "../etc", "debug").await.is_err());
    }
}
