use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u64,
    pub name: String,
    /// 本进程内承载的节点数量
    pub local_nodes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            name: "node".to_string(),
            local_nodes: 1,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id == 0 {
            return Err(anyhow::anyhow!("节点ID必须大于0"));
        }

        if self.name.is_empty() {
            return Err(anyhow::anyhow!("节点名称不能为空"));
        }

        if self.local_nodes == 0 {
            return Err(anyhow::anyhow!("本地节点数量必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub assign_policy: String, // "round_robin", "local"
    pub identity_shards: usize,
    /// 心跳超时时间（秒）
    pub heartbeat_timeout_seconds: i64,
    /// 检测间隔（秒）
    pub detection_interval_seconds: u64,
    /// 身份迁移窗口的过期时间（毫秒）
    pub move_expire_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            assign_policy: "round_robin".to_string(),
            identity_shards: 16,
            heartbeat_timeout_seconds: 90,
            detection_interval_seconds: 30,
            move_expire_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_policies = ["round_robin", "local"];
        if !valid_policies.contains(&self.assign_policy.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的节点分配策略: {}，支持的策略: {:?}",
                self.assign_policy,
                valid_policies
            ));
        }

        if self.identity_shards == 0 {
            return Err(anyhow::anyhow!("身份映射分片数必须大于0"));
        }

        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }

        if self.detection_interval_seconds == 0 {
            return Err(anyhow::anyhow!("检测间隔必须大于0"));
        }

        if self.move_expire_ms == 0 {
            return Err(anyhow::anyhow!("迁移过期时间必须大于0"));
        }

        Ok(())
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.detection_interval_seconds)
    }

    pub fn move_expire(&self) -> Duration {
        Duration::from_millis(self.move_expire_ms)
    }
}
