//! 认证相关的外部能力。
//!
//! 中继核心只关心"这条连接属于谁"，凭证格式与校验方式由 [`Authenticator`] 的实现决定。

use std::fmt;

use async_trait::async_trait;
use domain::{PasswordHash, UserId};
use serde::Serialize;
use thiserror::Error;

/// 客户端在建立连接时出示的凭证，对核心不透明。
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(****)")
    }
}

/// 通过认证的身份。同一个身份可以同时持有多条连接。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    pub user_id: UserId,
    pub name: String,
}

impl Principal {
    pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_id)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("unknown principal")]
    UnknownPrincipal,
    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError>;
}

#[derive(Debug, Error)]
pub enum PasswordHasherError {
    #[error("hash error: {0}")]
    Hash(String),
    #[error("verify error: {0}")]
    Verify(String),
}

impl PasswordHasherError {
    pub fn hash_error(message: impl Into<String>) -> Self {
        Self::Hash(message.into())
    }

    pub fn verify_error(message: impl Into<String>) -> Self {
        Self::Verify(message.into())
    }
}

#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, plaintext: &str) -> Result<PasswordHash, PasswordHasherError>;
    async fn verify(
        &self,
        plaintext: &str,
        hashed: &PasswordHash,
    ) -> Result<bool, PasswordHasherError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_not_leaked_by_debug() {
        let credentials = Credentials::bearer("secret-token");
        assert_eq!(format!("{:?}", credentials), "Credentials(****)");
        assert!(!credentials.is_empty());
        assert!(Credentials::bearer("   ").is_empty());
    }
}
