use async_trait::async_trait;

use crate::errors::Result;
use crate::models::TxnId;

/// 参与者在准备阶段的投票
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// 已准备好，等待提交回调
    Prepared,
    /// 本事务中未修改任何状态，不再需要提交回调
    ReadOnly,
}

/// 事务参与者
///
/// 任何在任务中修改共享状态的组件都要实现准备/提交/中止回调。
/// `prepare` 返回错误即视为否决，事务随之中止。所有准备成功后提交不可撤销，
/// 参与者自行保证提交步骤的崩溃安全。
#[async_trait]
pub trait Participant: Send + Sync {
    /// 用于日志和诊断的名称
    fn name(&self) -> &str;

    async fn prepare(&self, txn_id: TxnId) -> Result<PrepareVote>;

    async fn commit(&self, txn_id: TxnId) -> Result<()>;

    async fn abort(&self, txn_id: TxnId) -> Result<()>;
}
