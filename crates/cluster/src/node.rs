use std::fmt;

use chrono::{DateTime, Utc};
use scheduler_core::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Alive,
    /// 维护前排空，不再接收新身份
    Draining,
    Down,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Alive => f.write_str("ALIVE"),
            NodeStatus::Draining => f.write_str("DRAINING"),
            NodeStatus::Down => f.write_str("DOWN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            status: NodeStatus::Alive,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == NodeStatus::Alive
    }

    /// 存活节点的心跳是否已超时
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        if self.status != NodeStatus::Alive {
            return false;
        }
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}

/// 外部看门狗送来的节点事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Up { id: NodeId, name: String },
    Heartbeat(NodeId),
    Down(NodeId),
    Drain(NodeId),
}
