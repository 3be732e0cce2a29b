pub mod app_config;
pub mod cluster;
pub mod observability;
pub mod scheduler;
pub mod transaction;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use cluster::{CoordinatorConfig, NodeConfig};
pub use observability::ObservabilityConfig;
pub use scheduler::{PriorityWeights, RetryConfig, SchedulerConfig};
pub use transaction::TransactionConfig;
