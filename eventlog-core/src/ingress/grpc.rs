use super::push;
use crate::error::{EventLogError, Result};
use crate::metrics::PipelineMetrics;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::{Request, Response, Status, Streaming};

pub mod proto {
    tonic::include_proto!("eventlog");
}

use proto::event_log_server::{EventLog, EventLogServer};
use proto::{LogMessage, Reply};

const LISTENER: &str = "event";

/// Client-streaming `Log` RPC: every element's `log` bytes go to the event
/// input channel.
pub struct EventLogService {
    tx: mpsc::Sender<Bytes>,
    metrics: PipelineMetrics,
}

impl EventLogService {
    pub fn new(tx: mpsc::Sender<Bytes>, metrics: PipelineMetrics) -> Self {
        Self { tx, metrics }
    }
}

#[tonic::async_trait]
impl EventLog for EventLogService {
    async fn log(
        &self,
        request: Request<Streaming<LogMessage>>,
    ) -> std::result::Result<Response<Reply>, Status> {
        let mut stream = request.into_inner();
        loop {
            match stream.message().await {
                Ok(Some(message)) => {
                    push(LISTENER, &self.tx, Bytes::from(message.log), &self.metrics);
                }
                Ok(None) => break,
                Err(status) => {
                    tracing::debug!("Event log stream ended: {}", status);
                    break;
                }
            }
        }

        Ok(Response::new(Reply {
            status: "success".to_string(),
            message: String::new(),
        }))
    }
}

pub struct GrpcServer {
    listener: TcpListener,
}

impl GrpcServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            EventLogError::Internal(format!("failed to bind event log server {}: {}", addr, e))
        })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `token` is cancelled. A transport failure is reported on
    /// `fatal`.
    pub fn run(
        self,
        service: EventLogService,
        tracker: &TaskTracker,
        token: CancellationToken,
        fatal: mpsc::Sender<EventLogError>,
    ) {
        tracker.spawn(async move {
            tracing::info!("Event log server listening on {:?}", self.listener.local_addr());
            let shutdown = async move { token.cancelled().await };
            let result = tonic::transport::Server::builder()
                .add_service(EventLogServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), shutdown)
                .await;

            if let Err(e) = result {
                tracing::error!("Event log server failed: {}", e);
                let _ = fatal.send(e.into()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::event_log_client::EventLogClient;

    #[tokio::test]
    async fn test_stream_reaches_channel() {
        let server = GrpcServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let metrics = PipelineMetrics::unregistered().unwrap();
        server.run(
            EventLogService::new(tx, metrics),
            &tracker,
            token.clone(),
            fatal_tx,
        );

        let mut client = EventLogClient::connect(format!("http://{}", addr))
            .await
            .unwrap();
        let messages = vec![
            LogMessage { log: b"one".to_vec() },
            LogMessage { log: b"two".to_vec() },
        ];
        let reply = client
            .log(tokio_stream::iter(messages))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status, "success");

        assert_eq!(rx.recv().await.unwrap().as_ref(), b"one");
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"two");

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
