use crate::error::{EventLogError, Result};
use serde::{Deserialize, Serialize};

pub const INSTANCE_PREFIX: &str = "instance/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Create,
    Update,
    Abnormal,
    Delete,
}

/// One engine node as recorded in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub host_id: String,
    pub host_ip: String,
    pub pub_port: u16,
    pub web_port: u16,
    pub docker_log_port: u16,
    pub host_name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub tag_number: u32,
}

impl Instance {
    /// Registry key relative to the discover home.
    pub fn key(&self) -> String {
        instance_key(&self.host_ip, self.pub_port)
    }

    pub fn pub_addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.pub_port)
    }

    pub fn web_addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.web_port)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| EventLogError::InvalidMessage(format!("instance record: {}", e)))
    }
}

pub fn instance_key(host_ip: &str, pub_port: u16) -> String {
    format!("{}{}:{}", INSTANCE_PREFIX, host_ip, pub_port)
}
