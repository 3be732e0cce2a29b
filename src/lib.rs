//! 事务型任务执行核心的组合根
//!
//! `Application` 在一个进程内托管多个节点，`LocalCluster` 负责把任务路由到身份的归属节点。

pub mod app;
pub mod cluster;
pub mod shutdown;

pub use app::Application;
pub use cluster::LocalCluster;
pub use shutdown::ShutdownManager;
