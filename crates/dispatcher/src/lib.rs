pub mod delay_queue;
pub mod fair_queue;
pub mod retry_policy;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod test_utils;

pub use delay_queue::DelayQueue;
pub use fair_queue::FairQueue;
pub use retry_policy::{
    policy_from_config, BackoffRetryPolicy, ImmediateRetryPolicy, RetryDecision, RetryPolicy,
};
pub use scheduler::{TaskHandle, TaskRelocator, TaskScheduler};
pub use task::{NewTask, Recurrence, ScheduledTask, TaskBody};
