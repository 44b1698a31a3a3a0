use async_trait::async_trait;
use domain::{IdempotencyToken, Message, MessageContent, RepositoryError, SequenceId};

/// `persist` 的结果：存储中的那条消息，以及它是否由本次调用创建。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub message: Message,
    pub is_new: bool,
}

impl PersistOutcome {
    pub fn sequence_id(&self) -> SequenceId {
        self.message.sequence_id
    }
}

/// 只追加的消息日志，是序列号分配与去重的唯一权威。
///
/// 实现必须保证 (令牌 -> 序列号) 的检查与分配是原子的：同一令牌的并发写入只有一个胜者，
/// 其余调用看到 `is_new = false` 和胜者的序列号；序列号从 1 开始连续分配，没有空洞。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 令牌已存在时返回原消息，否则分配下一个序列号并写入。
    async fn persist(
        &self,
        idempotency_token: &IdempotencyToken,
        content: &MessageContent,
    ) -> Result<PersistOutcome, RepositoryError>;

    /// 按序列号升序返回所有大于 `after` 的消息。
    async fn read_since(&self, after: SequenceId) -> Result<Vec<Message>, RepositoryError>;

    /// 当前最大的序列号，空日志返回 [`SequenceId::ZERO`]。
    async fn latest_sequence(&self) -> Result<SequenceId, RepositoryError>;
}
