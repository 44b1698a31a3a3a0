use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::auth::PasswordHasherError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    /// 消息存储暂时不可用，客户端应使用同一幂等令牌重试。
    #[error("message store unavailable: {0}")]
    StoreUnavailable(RepositoryError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("password error: {0}")]
    Password(#[from] PasswordHasherError),
    #[error("authentication failed")]
    Authentication,
}

impl ApplicationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplicationError::StoreUnavailable(_))
    }
}
