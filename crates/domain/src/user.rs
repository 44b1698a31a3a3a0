use crate::value_objects::{PasswordHash, Timestamp, UserEmail, UserId, UserName};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: UserName,
    pub email: UserEmail,
    #[serde(skip_serializing)] // 密码字段不暴露给客户端
    pub password: PasswordHash,
    pub created_at: Timestamp,
}

impl User {
    pub fn register(
        id: UserId,
        name: UserName,
        email: UserEmail,
        password: PasswordHash,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            name,
            email,
            password,
            created_at: now,
        }
    }
}
