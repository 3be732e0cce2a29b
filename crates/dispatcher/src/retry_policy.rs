use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{RetryConfig, SchedulerConfig, SchedulerError, SchedulerResult};

use crate::task::ScheduledTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryLater(Duration),
    Drop,
}

/// 决定失败任务的去留
///
/// 只能依据任务的最后一次失败和运行历史做判断，不做任何I/O，也不能阻塞。
pub trait RetryPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// 任务没有记录失败原因时返回不变量错误
    fn decide(&self, task: &ScheduledTask) -> SchedulerResult<RetryDecision>;
}

fn last_failure_retryable(task: &ScheduledTask) -> SchedulerResult<Option<bool>> {
    task.last_failure()
        .map(|failure| failure.retryable)
        .ok_or_else(|| {
            SchedulerError::invariant(format!("任务 {} 没有失败原因，不能评估重试", task.id()))
        })
}

/// 保守的默认策略：只有失败明确请求重试时才立即重试，其余一律丢弃
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateRetryPolicy;

impl RetryPolicy for ImmediateRetryPolicy {
    fn name(&self) -> &str {
        "immediate"
    }

    fn decide(&self, task: &ScheduledTask) -> SchedulerResult<RetryDecision> {
        match last_failure_retryable(task)? {
            Some(true) => Ok(RetryDecision::RetryNow),
            // 周期任务也不例外：明确拒绝重试或不带重试信号都丢弃
            Some(false) | None => Ok(RetryDecision::Drop),
        }
    }
}

/// 有界指数退避策略
///
/// 与默认策略一样只重试明确请求重试的失败，但按重试次数退避，超过上限后丢弃。
#[derive(Debug, Clone)]
pub struct BackoffRetryPolicy {
    config: RetryConfig,
}

impl BackoffRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 计算第 `try_count` 次失败后的等待时间
    pub fn calculate_delay(&self, try_count: u32) -> Duration {
        let base_interval = self.config.base_interval_ms as f64;
        let multiplier = self.config.backoff_multiplier;
        let max_interval = self.config.max_interval_ms as f64;
        let jitter_factor = self.config.jitter_factor;

        // 计算指数退避间隔
        let exponent = i32::try_from(try_count.saturating_sub(1)).unwrap_or(i32::MAX);
        let exponential_interval = base_interval * multiplier.powi(exponent);

        // 限制最大间隔
        let capped_interval = exponential_interval.min(max_interval);

        // 添加随机抖动以避免雷群效应
        let jitter = capped_interval * jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).clamp(base_interval, max_interval);

        Duration::from_millis(final_interval as u64)
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn name(&self) -> &str {
        "backoff"
    }

    fn decide(&self, task: &ScheduledTask) -> SchedulerResult<RetryDecision> {
        match last_failure_retryable(task)? {
            Some(true) if task.try_count() <= self.config.max_retries => {
                Ok(RetryDecision::RetryLater(self.calculate_delay(task.try_count())))
            }
            _ => Ok(RetryDecision::Drop),
        }
    }
}

/// 按配置选择重试策略
pub fn policy_from_config(
    scheduler: &SchedulerConfig,
    retry: &RetryConfig,
) -> SchedulerResult<Arc<dyn RetryPolicy>> {
    match scheduler.retry_policy.as_str() {
        "immediate" => Ok(Arc::new(ImmediateRetryPolicy)),
        "backoff" => Ok(Arc::new(BackoffRetryPolicy::new(retry.clone()))),
        other => Err(SchedulerError::Configuration(format!(
            "未知的重试策略: {other}"
        ))),
    }
}
