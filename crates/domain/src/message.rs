use crate::value_objects::{IdempotencyToken, MessageContent, SequenceId};

/// 已持久化的消息。创建后不可变，也不会被删除。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub sequence_id: SequenceId,
    pub idempotency_token: IdempotencyToken,
    pub content: MessageContent,
}

impl Message {
    pub fn new(
        sequence_id: SequenceId,
        idempotency_token: IdempotencyToken,
        content: MessageContent,
    ) -> Self {
        Self {
            sequence_id,
            idempotency_token,
            content,
        }
    }
}
