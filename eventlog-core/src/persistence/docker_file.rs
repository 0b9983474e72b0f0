use super::MessagePersister;
use super::event_file::validate_id;
use crate::clock::SharedClock;
use crate::error::{EventLogError, Result};
use crate::message::EventLogMessage;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDate};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha224};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STDOUT_FILE: &str = "stdout.log";

/// Derives the on-disk directory name for a service.
///
/// Ids of 11 bytes or fewer are used as-is.
pub fn service_alias_id(service_id: &str) -> String {
    let bytes = service_id.as_bytes();
    if bytes.len() <= 11 {
        return service_id.to_string();
    }

    let seed = format!("{}{}{}log{}", bytes[10], service_id, bytes[3], bytes[2] / 7);
    let digest = Sha224::digest(seed.as_bytes());
    let mut alias = hex::encode(digest);
    alias.truncate(16);
    alias
}

/// Writes container stdout to `<home>/<alias>/stdout.log`, archiving the
/// previous day's file to `<YYYY-M-D>.log.gz` before the first write of a
/// new day.
pub struct DockerLogPersister {
    base_path: PathBuf,
    clock: SharedClock,
}

impl DockerLogPersister {
    pub fn new(home_path: &Path, clock: SharedClock) -> Result<Self> {
        std::fs::create_dir_all(home_path)?;
        Ok(Self {
            base_path: home_path.to_path_buf(),
            clock,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn service_dir(&self, service_id: &str) -> PathBuf {
        self.base_path.join(service_alias_id(service_id))
    }

    pub fn stdout_path(&self, service_id: &str) -> PathBuf {
        self.service_dir(service_id).join(STDOUT_FILE)
    }

    /// Moves yesterday's (or older) stdout.log into its gzip archive.
    async fn rotate_if_stale(&self, dir: &Path, path: &Path) -> Result<()> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let modified: DateTime<Local> = metadata.modified()?.into();
        let modified_day = modified.date_naive();
        let today = self.clock.now().with_timezone(&Local).date_naive();
        if modified_day == today {
            return Ok(());
        }

        let archive = dir.join(archive_name(modified_day));
        let source = path.to_path_buf();
        let archive_path = archive.clone();
        tokio::task::spawn_blocking(move || archive_file(&source, &archive_path))
            .await
            .map_err(|e| EventLogError::Internal(format!("archive task failed: {}", e)))??;

        tracing::info!("Archived {:?} to {:?}", path, archive);
        Ok(())
    }
}

#[async_trait]
impl MessagePersister for DockerLogPersister {
    fn name(&self) -> &'static str {
        "docker_file"
    }

    async fn save(&self, service_id: &str, messages: &[Arc<EventLogMessage>]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        validate_id(service_id)?;

        let dir = self.service_dir(service_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(STDOUT_FILE);
        self.rotate_if_stale(&dir, &path).await?;

        let size: usize = messages.iter().map(|m| m.content.len() + 1).sum();
        let mut body = Vec::with_capacity(size);
        for message in messages {
            body.extend_from_slice(&message.content);
            body.push(b'\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&body).await?;
        file.flush().await?;

        tracing::debug!(
            "Persisted {} container log lines for service {}",
            messages.len(),
            service_id
        );
        Ok(())
    }
}

fn archive_name(day: NaiveDate) -> String {
    format!("{}-{}-{}.log.gz", day.year(), day.month(), day.day())
}

fn archive_file(source: &Path, archive: &Path) -> Result<()> {
    let data = std::fs::read(source)?;
    let target = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(archive)?;
    let mut encoder = GzEncoder::new(target, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?.sync_all()?;
    std::fs::remove_file(source)?;
    Ok(())
}

/// Returns the last `lines` lines of a service's current stdout.log.
pub async fn tail_docker_log(base_path: &Path, service_id: &str, lines: usize) -> Result<Vec<String>> {
    validate_id(service_id)?;
    let path = base_path.join(service_alias_id(service_id)).join(STDOUT_FILE);
    let data = match fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let text = String::from_utf8_lossy(&data);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|line| line.to_string()).collect())
}
