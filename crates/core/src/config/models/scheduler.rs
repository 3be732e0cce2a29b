use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::Priority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 工作线程池上限
    pub worker_threads: usize,
    pub retry_policy: String, // "immediate", "backoff"
    pub priority_weights: PriorityWeights,
    /// 身份迁移中的任务重试前等待的时间（毫秒）
    pub relocation_retry_delay_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 8,
            retry_policy: "immediate".to_string(),
            priority_weights: PriorityWeights::default(),
            relocation_retry_delay_ms: 100,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_threads == 0 {
            return Err(anyhow::anyhow!("工作线程数必须大于0"));
        }

        let valid_policies = ["immediate", "backoff"];
        if !valid_policies.contains(&self.retry_policy.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的重试策略: {}，支持的策略: {:?}",
                self.retry_policy,
                valid_policies
            ));
        }

        self.priority_weights.validate()?;

        if self.relocation_retry_delay_ms == 0 {
            return Err(anyhow::anyhow!("迁移重试间隔必须大于0"));
        }

        Ok(())
    }

    pub fn relocation_retry_delay(&self) -> Duration {
        Duration::from_millis(self.relocation_retry_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// 各优先级在公平出队中的权重
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub real_time: u32,
    pub highest: u32,
    pub high: u32,
    pub normal: u32,
    pub low: u32,
    pub lowest: u32,
    pub optional: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            real_time: 32,
            highest: 16,
            high: 8,
            normal: 4,
            low: 2,
            lowest: 1,
            optional: 1,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, priority: Priority) -> u32 {
        match priority {
            Priority::RealTime => self.real_time,
            Priority::Highest => self.highest,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
            Priority::Lowest => self.lowest,
            Priority::Optional => self.optional,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for priority in Priority::ALL {
            if self.weight(priority) == 0 {
                return Err(anyhow::anyhow!("优先级 {} 的权重必须大于0", priority));
            }
        }
        Ok(())
    }
}

/// 指数退避重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 最大重试次数
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 50,
            max_interval_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: 10,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_interval_ms == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }

        if self.max_interval_ms < self.base_interval_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动系数必须在0.0到1.0之间"));
        }

        Ok(())
    }
}
