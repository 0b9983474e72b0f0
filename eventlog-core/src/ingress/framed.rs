use super::push;
use crate::error::{EventLogError, Result};
use crate::metrics::PipelineMetrics;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const HEARTBEAT: &[u8] = b"0x00ping";
pub const MAX_EMPTY_READS: usize = 100;

const LISTENER: &str = "docker";
const MAX_FRAME_SIZE: usize = i32::MAX as usize;
const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFrame {
    Payload(Bytes),
    Heartbeat,
    /// A zero-length frame: the producer is done.
    Close,
}

/// `[length: u32 LE][payload]` framing used by container log producers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerLogCodec;

impl Decoder for ContainerLogCodec {
    type Item = LogFrame;
    type Error = EventLogError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(EventLogError::Protocol(format!(
                "frame of {} bytes exceeds maximum",
                length
            )));
        }
        if src.len() < 4 + length {
            // The header is untrusted; grow one read buffer at a time.
            let remaining = 4 + length - src.len();
            src.reserve(remaining.min(READ_BUFFER));
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(LogFrame::Close));
        }
        let payload = src.split_to(length).freeze();
        if payload.as_ref() == HEARTBEAT {
            return Ok(Some(LogFrame::Heartbeat));
        }
        Ok(Some(LogFrame::Payload(payload)))
    }
}

impl Encoder<Bytes> for ContainerLogCodec {
    type Error = EventLogError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(EventLogError::Protocol(format!(
                "frame of {} bytes exceeds maximum",
                item.len()
            )));
        }
        dst.reserve(4 + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Framed-TCP listener for container stdout.
pub struct FramedLogServer {
    listener: TcpListener,
    idle_timeout: Duration,
}

impl FramedLogServer {
    pub async fn bind(addr: &str, idle_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            EventLogError::Internal(format!("failed to bind container log server {}: {}", addr, e))
        })?;
        Ok(Self {
            listener,
            idle_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn run(
        self,
        tx: mpsc::Sender<Bytes>,
        metrics: PipelineMetrics,
        tracker: &TaskTracker,
        token: CancellationToken,
    ) {
        let conn_tracker = tracker.clone();
        tracker.spawn(async move {
            tracing::info!(
                "Container log server listening on {:?}",
                self.listener.local_addr()
            );
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = self.listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Container log producer {} connected", peer);
                        let tx = tx.clone();
                        let metrics = metrics.clone();
                        let token = token.clone();
                        let idle = self.idle_timeout;
                        conn_tracker.spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                result = read_frames(stream, idle, &tx, &metrics) => {
                                    match result {
                                        Ok(()) => tracing::debug!("Container log producer {} closed", peer),
                                        Err(e) => tracing::warn!("Container log producer {} dropped: {}", peer, e),
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Container log server accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }
}

/// Reads frames until the producer closes, idles out or stalls.
pub async fn read_frames<R>(
    mut reader: R,
    idle: Duration,
    tx: &mpsc::Sender<Bytes>,
    metrics: &PipelineMetrics,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut codec = ContainerLogCodec;
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    let mut empty_reads = 0usize;

    loop {
        while let Some(frame) = codec.decode(&mut buf)? {
            match frame {
                LogFrame::Payload(payload) => {
                    push(LISTENER, tx, payload, metrics);
                }
                LogFrame::Heartbeat => {}
                LogFrame::Close => return Ok(()),
            }
        }

        let read = tokio::time::timeout(idle, reader.read_buf(&mut buf))
            .await
            .map_err(|_| {
                EventLogError::Protocol(format!("connection idle for more than {:?}", idle))
            })??;

        if read == 0 {
            if buf.is_empty() {
                return Ok(());
            }
            empty_reads += 1;
            if empty_reads >= MAX_EMPTY_READS {
                return Err(EventLogError::NoProgress(empty_reads));
            }
        } else {
            empty_reads = 0;
        }
    }
}
