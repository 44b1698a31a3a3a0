use std::sync::Arc;

use domain::{DomainError, RepositoryError, User, UserEmail, UserId, UserName};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::PasswordHasher, clock::Clock, error::ApplicationError, repository::UserRepository,
};

#[derive(Debug, Clone)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AuthenticateUserRequest {
    pub email: String,
    pub password: String,
}

pub struct UserServiceDependencies {
    pub user_repository: Arc<dyn UserRepository>,
    pub password_hasher: Arc<dyn PasswordHasher>,
    pub clock: Arc<dyn Clock>,
}

/// 账号注册与密码登录。
pub struct UserService {
    deps: UserServiceDependencies,
}

impl UserService {
    pub fn new(deps: UserServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn register(&self, request: RegisterUserRequest) -> Result<User, ApplicationError> {
        let name = UserName::parse(request.name)?;
        let email = UserEmail::parse(request.email)?;
        if request.password.is_empty() {
            return Err(DomainError::invalid_argument("password", "cannot be empty").into());
        }

        if self
            .deps
            .user_repository
            .find_by_email(&email)
            .await?
            .is_some()
        {
            return Err(ApplicationError::Domain(DomainError::UserAlreadyExists));
        }

        let password_hash = self.deps.password_hasher.hash(&request.password).await?;
        let user = User::register(
            UserId::from(Uuid::new_v4()),
            name,
            email,
            password_hash,
            self.deps.clock.now(),
        );

        // 并发注册同一邮箱时由仓储的唯一约束兜底
        let stored = match self.deps.user_repository.create(user).await {
            Ok(user) => user,
            Err(RepositoryError::Conflict) => {
                return Err(ApplicationError::Domain(DomainError::UserAlreadyExists))
            }
            Err(err) => return Err(err.into()),
        };
        info!(user_id = %stored.id, "user registered");
        Ok(stored)
    }

    pub async fn authenticate(
        &self,
        request: AuthenticateUserRequest,
    ) -> Result<User, ApplicationError> {
        let email = UserEmail::parse(request.email).map_err(|_| ApplicationError::Authentication)?;
        let user = self
            .deps
            .user_repository
            .find_by_email(&email)
            .await?
            .ok_or(ApplicationError::Authentication)?;

        let password_ok = self
            .deps
            .password_hasher
            .verify(&request.password, &user.password)
            .await?;
        if !password_ok {
            return Err(ApplicationError::Authentication);
        }

        Ok(user)
    }

    pub async fn find_user(&self, id: UserId) -> Result<Option<User>, ApplicationError> {
        Ok(self.deps.user_repository.find_by_id(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use domain::PasswordHash;

    use super::*;
    use crate::{auth::PasswordHasherError, memory::InMemoryUserRepository};

    struct PlainHasher;

    #[async_trait]
    impl PasswordHasher for PlainHasher {
        async fn hash(&self, plaintext: &str) -> Result<PasswordHash, PasswordHasherError> {
            PasswordHash::new(format!("plain:{plaintext}"))
                .map_err(|err| PasswordHasherError::hash_error(err.to_string()))
        }

        async fn verify(
            &self,
            plaintext: &str,
            hashed: &PasswordHash,
        ) -> Result<bool, PasswordHasherError> {
            Ok(hashed.as_str() == format!("plain:{plaintext}"))
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn service() -> UserService {
        UserService::new(UserServiceDependencies {
            user_repository: Arc::new(InMemoryUserRepository::new()),
            password_hasher: Arc::new(PlainHasher),
            clock: Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())),
        })
    }

    fn alice() -> RegisterUserRequest {
        RegisterUserRequest {
            name: "alice".into(),
            email: "Alice@Example.com".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn register_hashes_password_and_normalizes_email() {
        let service = service();
        let user = service.register(alice()).await.unwrap();

        assert_eq!(user.email.as_str(), "alice@example.com");
        assert_eq!(user.password.as_str(), "plain:secret");
        assert_eq!(
            user.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(service.find_user(user.id).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let service = service();
        service.register(alice()).await.unwrap();

        let err = service.register(alice()).await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::UserAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn empty_password_is_rejected() {
        let mut request = alice();
        request.password.clear();

        let err = service().register(request).await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let service = service();
        let user = service.register(alice()).await.unwrap();

        let found = service
            .authenticate(AuthenticateUserRequest {
                email: "alice@example.com".into(),
                password: "secret".into(),
            })
            .await
            .unwrap();
        assert_eq!(found.id, user.id);

        let wrong = service
            .authenticate(AuthenticateUserRequest {
                email: "alice@example.com".into(),
                password: "nope".into(),
            })
            .await;
        assert!(matches!(wrong, Err(ApplicationError::Authentication)));

        let unknown = service
            .authenticate(AuthenticateUserRequest {
                email: "bob@example.com".into(),
                password: "secret".into(),
            })
            .await;
        assert!(matches!(unknown, Err(ApplicationError::Authentication)));
    }
}
