use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    cluster::{CoordinatorConfig, NodeConfig},
    observability::ObservabilityConfig,
    scheduler::{RetryConfig, SchedulerConfig},
    transaction::TransactionConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub scheduler: SchedulerConfig,
    pub transaction: TransactionConfig,
    pub retry: RetryConfig,
    pub coordinator: CoordinatorConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: SCHEDULER_, nesting: `__`)
    ///
    /// e.g. `SCHEDULER_TRANSACTION__LOCK_TIMEOUT_MS=500`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/scheduler.toml",
                "scheduler.toml",
                "/etc/scheduler/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("节点配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.transaction.validate().context("事务配置验证失败")?;
        self.retry.validate().context("重试配置验证失败")?;
        self.coordinator
            .validate()
            .context("协调器配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.retry_policy, "immediate");
        assert_eq!(config.coordinator.assign_policy, "round_robin");
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let mut config = AppConfig::default();
        config.transaction.lock_timeout_ms = 250;
        config.scheduler.priority_weights.high = 5;

        let toml_str = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&toml_str).unwrap();

        assert_eq!(parsed.transaction.lock_timeout_ms, 250);
        assert_eq!(parsed.scheduler.priority_weights.high, 5);
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.retry_policy = "forever".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_priority_weight_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.priority_weights.optional = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = 7
name = "edge"
local_nodes = 3

[transaction]
lock_timeout_ms = 300
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.node.node_id, 7);
        assert_eq!(config.node.local_nodes, 3);
        assert_eq!(config.transaction.lock_timeout_ms, 300);
        assert_eq!(config.transaction.lock_shards, 16);
        assert_eq!(config.scheduler.worker_threads, 8);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/scheduler.toml")).is_err());
    }
}
