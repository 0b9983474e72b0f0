mod common;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use common::{RecordingStatus, eventually, start_node};
use eventlog_core::cluster::MultipartCodec;
use eventlog_core::ingress::grpc::proto::LogMessage;
use eventlog_core::ingress::grpc::proto::event_log_client::EventLogClient;
use eventlog_core::message::MonitorMessage;
use eventlog_core::persistence::service_alias_id;
use eventlog_core::{LogStatusSink, ManualClock, MemoryRegistry, SubscriptionKind, system_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

fn event_json(event_id: &str, step: &str, message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "event_id": event_id,
        "step": step,
        "status": "success",
        "message": message,
        "level": "info",
    }))
    .unwrap()
}

fn container_frame(service_id: &str, line: &str) -> Bytes {
    let payload = format!("abcdef123456{} {}", service_id, line);
    let mut frame = BytesMut::new();
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(payload.as_bytes());
    frame.freeze()
}

#[tokio::test]
async fn test_single_event_happy_path() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let status = Arc::new(RecordingStatus::default());
    let registry = MemoryRegistry::new(common::NAMESPACE);
    let node = start_node("node-a", &registry, clock.clone(), status.clone()).await;

    let peer = TcpStream::connect(node.cluster.pub_socket().local_addr())
        .await
        .unwrap();
    let mut frames = FramedRead::new(peer, MultipartCodec);
    assert!(eventually(|| node.cluster.pub_socket().peer_count() == 1).await);

    let mut client = EventLogClient::connect(format!("http://{}", node.ingress.addrs().event_log))
        .await
        .unwrap();
    let messages = vec![
        LogMessage { log: event_json("abc", "info", "pulling image") },
        LogMessage { log: event_json("abc", "info", "building") },
        LogMessage { log: event_json("abc", "last", "done") },
    ];
    let reply = client
        .log(tokio_stream::iter(messages))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.status, "success");
    drop(client);

    let mut published = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while published.len() < 3 {
            let parts = frames.next().await.unwrap().unwrap();
            if parts[0].as_ref() == b"event_log" {
                published.push(parts[1].clone());
            }
        }
    })
    .await
    .unwrap();
    let last: serde_json::Value = serde_json::from_slice(&published[2]).unwrap();
    assert_eq!(last["step"], "last");

    let path = node.home().join("eventlog").join("abc.log");
    assert!(
        eventually(|| {
            std::fs::read_to_string(&path)
                .map(|text| text.lines().count() == 3)
                .unwrap_or(false)
        })
        .await
    );
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.lines().all(|line| line.starts_with("1 ")));
    assert!(text.ends_with("done\n"));

    assert!(eventually(|| status.callbacks.lock().len() == 1).await);
    assert_eq!(
        status.callbacks.lock()[0],
        ("abc".to_string(), "success".to_string(), "done".to_string())
    );

    let stores = node.cluster.store().stores().clone();
    assert!(stores.event.get("abc").is_some());
    clock.advance(chrono::Duration::seconds(31));
    stores.gc().await;
    assert!(stores.event.get("abc").is_none());

    node.stop().await;
}

#[tokio::test]
async fn test_container_log_fan_out() {
    let registry = MemoryRegistry::new(common::NAMESPACE);
    let node = start_node("node-a", &registry, system_clock(), Arc::new(LogStatusSink)).await;
    let service_id = format!("{:0<32}", "svc001");

    let mut producer = TcpStream::connect(node.ingress.addrs().docker_log)
        .await
        .unwrap();
    let mut s1 = node
        .hub
        .subscribe(SubscriptionKind::Docker, &service_id, "s1")
        .unwrap();

    for i in 0..5 {
        producer
            .write_all(&container_frame(&service_id, &format!("line-{}", i)))
            .await
            .unwrap();
    }
    let mut seen_s1 = Vec::new();
    for _ in 0..5 {
        let message = tokio::time::timeout(Duration::from_secs(5), s1.recv())
            .await
            .unwrap()
            .unwrap();
        seen_s1.push(String::from_utf8(message.content.to_vec()).unwrap());
    }

    let mut s2 = node
        .hub
        .subscribe(SubscriptionKind::Docker, &service_id, "s2")
        .unwrap();
    for i in 5..10 {
        producer
            .write_all(&container_frame(&service_id, &format!("line-{}", i)))
            .await
            .unwrap();
    }
    let mut seen_s2 = Vec::new();
    for _ in 0..5 {
        let message = tokio::time::timeout(Duration::from_secs(5), s1.recv())
            .await
            .unwrap()
            .unwrap();
        seen_s1.push(String::from_utf8(message.content.to_vec()).unwrap());
        let message = tokio::time::timeout(Duration::from_secs(5), s2.recv())
            .await
            .unwrap()
            .unwrap();
        seen_s2.push(String::from_utf8(message.content.to_vec()).unwrap());
    }

    let expected: Vec<String> = (0..10).map(|i| format!("line-{}", i)).collect();
    assert_eq!(seen_s1, expected);
    assert_eq!(seen_s2, expected[5..].to_vec());
    assert!(s2.try_recv().is_none());

    drop(producer);
    node.stop().await;

    let alias = service_alias_id(&service_id);
    assert_eq!(alias.len(), 16);
    assert_eq!(alias, service_alias_id(&service_id));
    let stdout = std::fs::read_to_string(node.home().join(&alias).join("stdout.log")).unwrap();
    assert_eq!(stdout, expected.join("\n") + "\n");
}

#[tokio::test]
async fn test_monitor_reports_merge_over_udp() {
    let registry = MemoryRegistry::new(common::NAMESPACE);
    let node = start_node("node-a", &registry, system_clock(), Arc::new(LogStatusSink)).await;
    let mut sub = node
        .hub
        .subscribe(SubscriptionKind::NewMonitor, "svc", "ws")
        .unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = node.ingress.addrs().new_monitor.unwrap();
    for (host, weight) in [("host-a", 1.0), ("host-b", 0.5)] {
        let messages: Vec<serde_json::Value> = (0..30)
            .map(|i| {
                serde_json::json!({
                    "key": format!("/k{}", i),
                    "count": 1,
                    "avg_time": 0.333,
                    "cumulative_time": i as f64 * weight,
                })
            })
            .collect();
        let report = serde_json::json!({
            "service_id": "svc",
            "host_name": host,
            "messages": messages,
        });
        socket
            .send_to(&serde_json::to_vec(&report).unwrap(), target)
            .await
            .unwrap();
    }

    let mut merged: Vec<MonitorMessage> = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while merged.first().map(|m| m.count) != Some(2) {
            let message = sub.recv().await.unwrap();
            merged = serde_json::from_slice(message.monitor_data.as_ref().unwrap()).unwrap();
        }
    })
    .await
    .unwrap();

    assert_eq!(merged.len(), 20);
    assert!(merged
        .windows(2)
        .all(|w| w[0].cumulative_time >= w[1].cumulative_time));
    assert_eq!(merged[0].key, "/k29");
    assert_eq!(merged[0].cumulative_time, 43.5);
    assert!(merged.iter().all(|m| m.count == 2));
    assert_eq!(merged[0].avg_time, 0.33);

    node.stop().await;
}
