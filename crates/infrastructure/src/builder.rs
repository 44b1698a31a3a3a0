use std::sync::Arc;

use application::{MessageStore, PasswordHasher, UserRepository};
use thiserror::Error;
use tracing::info;

use crate::{
    migrations::MIGRATOR,
    password::BcryptPasswordHasher,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Postgres 后端的全部适配器。
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
    pub password_hasher: Arc<BcryptPasswordHasher>,
}

impl Infrastructure {
    /// 建立连接池并执行迁移。
    pub async fn connect(config: InfrastructureConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database_url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        info!(max_connections = config.max_connections, "database migrations applied");

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
            password_hasher: Arc::new(BcryptPasswordHasher::new(config.bcrypt_cost)),
        })
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.storage.message_store.clone()
    }

    pub fn user_repository(&self) -> Arc<dyn UserRepository> {
        self.storage.user_repository.clone()
    }

    pub fn password_hasher_trait(&self) -> Arc<dyn PasswordHasher> {
        self.password_hasher.clone()
    }
}
