//! Process-wide sink for messages whose flush failed.

use crate::barrel::SharedMessage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct GarbageQueue {
    tx: mpsc::Sender<Vec<SharedMessage>>,
}

impl GarbageQueue {
    /// Creates the queue and the worker that appends batches to `path`
    /// every `interval`; the worker drains once more on cancellation.
    pub fn new(
        path: PathBuf,
        interval: Duration,
        capacity: usize,
        token: CancellationToken,
    ) -> (Self, GarbageWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self { tx },
            GarbageWorker {
                path,
                interval,
                rx,
                token,
            },
        )
    }

    pub fn push(&self, messages: Vec<SharedMessage>) {
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        if self.tx.try_send(messages).is_err() {
            tracing::error!("Garbage queue is full, {} messages lost", count);
        }
    }
}

pub struct GarbageWorker {
    path: PathBuf,
    interval: Duration,
    rx: mpsc::Receiver<Vec<SharedMessage>>,
    token: CancellationToken,
}

impl GarbageWorker {
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut pending: Vec<SharedMessage> = Vec::new();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                batch = self.rx.recv() => match batch {
                    Some(batch) => pending.extend(batch),
                    None => break,
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        write_batch(&self.path, std::mem::take(&mut pending)).await;
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(batch) = self.rx.try_recv() {
            pending.extend(batch);
        }
        if !pending.is_empty() {
            write_batch(&self.path, pending).await;
        }
    }
}

pub fn garbage_line(message: &SharedMessage) -> String {
    let text = if message.message.is_empty() {
        String::from_utf8_lossy(&message.content).into_owned()
    } else {
        message.message.clone()
    };
    format!(
        "({}-{}) {}: {}\n",
        message.step, message.level, message.time, text
    )
}

async fn write_batch(path: &Path, batch: Vec<SharedMessage>) {
    let body: String = batch.iter().map(garbage_line).collect();
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await
    }
    .await;

    match result {
        Ok(()) => tracing::warn!("Wrote {} garbage messages to {:?}", batch.len(), path),
        Err(e) => tracing::error!("Failed to write garbage file {:?}: {}", path, e),
    }
}
