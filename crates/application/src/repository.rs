use async_trait::async_trait;
use domain::{RepositoryError, User, UserEmail, UserId};

#[async_trait]
pub trait UserRepository: Send + Sync {
    // 邮箱重复时返回 RepositoryError::Conflict
    async fn create(&self, user: User) -> Result<User, RepositoryError>;
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
    async fn find_by_email(&self, email: &UserEmail) -> Result<Option<User>, RepositoryError>;
}
