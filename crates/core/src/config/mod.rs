//! 配置管理
//!
//! 配置来源按优先级从低到高：内置默认值、TOML 配置文件、`SCHEDULER_` 前缀、`__` 分隔层级的环境变量。
//! 每个配置段都提供 `validate()`，加载完成后统一校验。

pub mod models;

pub use models::{
    AppConfig, CoordinatorConfig, NodeConfig, ObservabilityConfig, PriorityWeights,
    RetryConfig, SchedulerConfig, TransactionConfig,
};
