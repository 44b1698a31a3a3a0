//! 进程内的存储实现，用于开发环境和测试。

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{
    IdempotencyToken, Message, MessageContent, RepositoryError, SequenceId, User, UserEmail,
    UserId,
};
use tokio::sync::{Mutex, RwLock};

use crate::{
    repository::UserRepository,
    store::{MessageStore, PersistOutcome},
};

/// 内存中的消息日志。
///
/// 单个互斥锁就是唯一的写入串行点，所以查重与分配序列号天然是原子的。
#[derive(Default)]
pub struct InMemoryMessageStore {
    log: Mutex<MessageLog>,
}

#[derive(Default)]
struct MessageLog {
    messages: Vec<Message>,
    tokens: HashMap<IdempotencyToken, usize>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist(
        &self,
        idempotency_token: &IdempotencyToken,
        content: &MessageContent,
    ) -> Result<PersistOutcome, RepositoryError> {
        let mut log = self.log.lock().await;

        if let Some(&index) = log.tokens.get(idempotency_token) {
            let message = log
                .messages
                .get(index)
                .cloned()
                .ok_or_else(|| RepositoryError::storage("token index out of sync"))?;
            return Ok(PersistOutcome {
                message,
                is_new: false,
            });
        }

        let sequence_id = SequenceId::new(log.messages.len() as u64 + 1);
        let message = Message::new(sequence_id, idempotency_token.clone(), content.clone());
        let index = log.messages.len();
        log.messages.push(message.clone());
        log.tokens.insert(idempotency_token.clone(), index);

        Ok(PersistOutcome {
            message,
            is_new: true,
        })
    }

    async fn read_since(&self, after: SequenceId) -> Result<Vec<Message>, RepositoryError> {
        let log = self.log.lock().await;
        let start = log
            .messages
            .partition_point(|message| message.sequence_id <= after);
        Ok(log.messages[start..].to_vec())
    }

    async fn latest_sequence(&self) -> Result<SequenceId, RepositoryError> {
        let log = self.log.lock().await;
        Ok(log
            .messages
            .last()
            .map(|message| message.sequence_id)
            .unwrap_or(SequenceId::ZERO))
    }
}

/// 内存中的用户仓储。
#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<UserId, User>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let mut users = self.users.write().await;
        if users.values().any(|existing| existing.email == user.email) {
            return Err(RepositoryError::Conflict);
        }
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &UserEmail) -> Result<Option<User>, RepositoryError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|user| &user.email == email)
            .cloned())
    }
}
