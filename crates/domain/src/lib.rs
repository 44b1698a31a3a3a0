//! 消息中继的核心领域模型。
//!
//! 包含消息、用户等实体，以及序列号、幂等令牌等值对象和错误定义。

pub mod errors;
pub mod message;
pub mod user;
pub mod value_objects;

pub use errors::{DomainError, RepositoryError};
pub use message::Message;
pub use user::User;
pub use value_objects::{
    ConnectionId, IdempotencyToken, MessageContent, PasswordHash, SequenceId, Timestamp,
    UserEmail, UserId, UserName,
};
