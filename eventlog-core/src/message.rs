//! Message types carried through the pipeline and over the peer wire.

use crate::error::{EventLogError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const STEP_PROGRESS: &str = "progress";
pub const STEP_LAST: &str = "last";
pub const STEP_CALLBACK: &str = "callback";
pub const STEP_CODE_VERSION: &str = "code-version";

pub const LEVEL_ERROR: &str = "error";
pub const LEVEL_INFO: &str = "info";
pub const LEVEL_DEBUG: &str = "debug";

const CONTAINER_ID_LEN: usize = 12;
const SERVICE_ID_LEN: usize = 32;
/// container id + service id + one separator byte
pub const CONTAINER_LOG_HEADER_LEN: usize = CONTAINER_ID_LEN + SERVICE_ID_LEN + 1;

/// A single structured log record.
///
/// Operation events arrive as JSON; container logs carry the original line in
/// `content`; merged monitor output travels in `monitor_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLogMessage {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub time: String,
    #[serde(skip)]
    pub content: Bytes,
    #[serde(skip)]
    pub monitor_data: Option<Bytes>,
}

impl EventLogMessage {
    /// Decodes an operation-event JSON record, keeping the raw bytes as content.
    pub fn decode_event(raw: Bytes) -> Result<Self> {
        let mut message: EventLogMessage = serde_json::from_slice(&raw)
            .map_err(|e| EventLogError::InvalidMessage(format!("event log json: {}", e)))?;
        message.content = raw;
        Ok(message)
    }

    /// Splits a container-log frame into service id and log line.
    pub fn decode_container_log(raw: Bytes) -> Result<Self> {
        if raw.len() < CONTAINER_LOG_HEADER_LEN {
            return Err(EventLogError::InvalidMessage(format!(
                "container log frame too short: {} bytes",
                raw.len()
            )));
        }

        let service_id = std::str::from_utf8(&raw[CONTAINER_ID_LEN..CONTAINER_ID_LEN + SERVICE_ID_LEN])
            .map_err(|e| EventLogError::InvalidMessage(format!("container log service id: {}", e)))?
            .to_string();

        Ok(EventLogMessage {
            event_id: service_id,
            content: raw.slice(CONTAINER_LOG_HEADER_LEN..),
            ..Default::default()
        })
    }

    pub fn is_progress(&self) -> bool {
        self.step == STEP_PROGRESS
    }

    pub fn is_terminal(&self) -> bool {
        self.step == STEP_LAST || self.step == STEP_CALLBACK
    }

    /// Level flag used by the per-event file. Unknown levels map to `0`,
    /// the same flag as `error`.
    pub fn level_flag(&self) -> char {
        match self.level.as_str() {
            LEVEL_INFO => '1',
            LEVEL_DEBUG => '2',
            _ => '0',
        }
    }
}

/// `check_level(flag, requested)`: whether a stored line with `flag` is
/// returned to a reader asking for `requested`.
pub fn check_level(flag: &str, requested: &str) -> bool {
    match flag {
        "0" => true,
        "1" => requested != LEVEL_ERROR,
        "2" => requested == LEVEL_DEBUG,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterMode {
    EventLog,
    Monitor,
    MonitorMessage,
    NewMonitorMessage,
}

impl ClusterMode {
    pub const ALL: [ClusterMode; 4] = [
        ClusterMode::EventLog,
        ClusterMode::Monitor,
        ClusterMode::MonitorMessage,
        ClusterMode::NewMonitorMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterMode::EventLog => "event_log",
            ClusterMode::Monitor => "monitor",
            ClusterMode::MonitorMessage => "monitor_message",
            ClusterMode::NewMonitorMessage => "new_monitor_message",
        }
    }

    pub fn from_topic(topic: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().as_bytes() == topic)
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `[topic, payload]` pair as it travels between peers.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub mode: ClusterMode,
    pub data: Bytes,
}

impl ClusterMessage {
    pub fn new(mode: ClusterMode, data: impl Into<Bytes>) -> Self {
        Self {
            mode,
            data: data.into(),
        }
    }

    pub fn into_parts(self) -> Vec<Bytes> {
        vec![Bytes::from_static(self.mode.as_str().as_bytes()), self.data]
    }
}

/// Load report each instance emits on the `monitor` topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorData {
    pub instance_id: String,
    pub service_size: u64,
    pub log_size_per_minute: u64,
}

impl MonitorData {
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{}",
            self.instance_id, self.service_size, self.log_size_per_minute
        )
    }

    /// Routing weight; lower is preferred.
    pub fn score(&self) -> u64 {
        self.log_size_per_minute
            .saturating_add(self.service_size.saturating_mul(20))
    }
}

impl FromStr for MonitorData {
    type Err = EventLogError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(',').collect();
        if fields.len() != 3 {
            return Err(EventLogError::InvalidMessage(format!(
                "monitor data expects 3 fields, got {}: {}",
                fields.len(),
                s
            )));
        }

        let parse = |name: &str, value: &str| {
            value.trim().parse::<u64>().map_err(|e| {
                EventLogError::InvalidMessage(format!("monitor data {} '{}': {}", name, value, e))
            })
        };

        Ok(MonitorData {
            instance_id: fields[0].trim().to_string(),
            service_size: parse("service_size", fields[1])?,
            log_size_per_minute: parse("log_size_per_minute", fields[2])?,
        })
    }
}

/// One performance sample of a service endpoint, keyed by `key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorMessage {
    pub key: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub abnormal_count: u64,
    #[serde(default)]
    pub avg_time: f64,
    #[serde(default)]
    pub max_time: f64,
    #[serde(default)]
    pub cumulative_time: f64,
}

impl MonitorMessage {
    /// Folds `other` (same key) into `self`.
    pub fn merge(&mut self, other: &MonitorMessage) {
        self.count += other.count;
        self.abnormal_count += other.abnormal_count;
        self.avg_time = round2((self.avg_time + other.avg_time) / 2.0);
        self.cumulative_time += other.cumulative_time;
        self.max_time = self.max_time.max(other.max_time);
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A host's report for one service, as received over UDP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub service_id: String,
    #[serde(default)]
    pub port: String,
    pub host_name: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub messages: Vec<MonitorMessage>,
}

impl MonitorReport {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let report: MonitorReport = serde_json::from_slice(raw)
            .map_err(|e| EventLogError::InvalidMessage(format!("monitor report json: {}", e)))?;
        if report.service_id.is_empty() {
            return Err(EventLogError::InvalidMessage(
                "monitor report without service_id".to_string(),
            ));
        }
        Ok(report)
    }
}

#[derive(Debug, Deserialize)]
struct LegacyMonitorHeader {
    #[serde(alias = "ServiceID")]
    service_id: String,
}

/// Wraps a legacy monitor payload so it can be relayed by service id.
pub fn decode_legacy_monitor(raw: Bytes) -> Result<EventLogMessage> {
    let header: LegacyMonitorHeader = serde_json::from_slice(&raw)
        .map_err(|e| EventLogError::InvalidMessage(format!("monitor message json: {}", e)))?;
    if header.service_id.is_empty() {
        return Err(EventLogError::InvalidMessage(
            "monitor message without service id".to_string(),
        ));
    }
    Ok(EventLogMessage {
        event_id: header.service_id,
        monitor_data: Some(raw.clone()),
        content: raw,
        ..Default::default()
    })
}
