use crate::models::{IdentityId, NodeId};

/// 身份当前所处的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityLocation {
    /// 尚未分配节点
    Unassigned,
    /// 归属于某个节点
    Owned(NodeId),
    /// 正在从 `from` 迁移到 `to`，期间影响该身份的写入必须被拒绝
    InTransit { from: NodeId, to: NodeId },
}

/// 身份归属查询接口，由节点映射存储实现，调度器据此拒绝不属于本节点的任务
pub trait IdentityOwnership: Send + Sync {
    fn location(&self, identity: &IdentityId) -> IdentityLocation;
}
