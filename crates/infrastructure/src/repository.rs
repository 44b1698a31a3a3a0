use std::sync::Arc;

use application::{MessageStore, PersistOutcome, UserRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    IdempotencyToken, Message, MessageContent, PasswordHash, RepositoryError, SequenceId, User,
    UserEmail, UserId, UserName,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

// pg_advisory_xact_lock 的键，串行化所有对消息日志的追加
const MESSAGE_LOG_LOCK: i64 = 0x6d73_675f_6c6f_67;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return RepositoryError::Conflict;
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    sequence_id: i64,
    idempotency_token: String,
    content: String,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let sequence_id = u64::try_from(value.sequence_id)
            .map_err(|_| invalid_data(format!("negative sequence id {}", value.sequence_id)))?;
        let idempotency_token = IdempotencyToken::parse(value.idempotency_token)
            .map_err(|err| invalid_data(err.to_string()))?;
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;

        Ok(Message::new(
            SequenceId::new(sequence_id),
            idempotency_token,
            content,
        ))
    }
}

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    name: String,
    email: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRecord> for User {
    type Error = RepositoryError;

    fn try_from(value: UserRecord) -> Result<Self, Self::Error> {
        let name = UserName::parse(value.name).map_err(|err| invalid_data(err.to_string()))?;
        let email = UserEmail::parse(value.email).map_err(|err| invalid_data(err.to_string()))?;
        let password =
            PasswordHash::new(value.password_hash).map_err(|err| invalid_data(err.to_string()))?;

        Ok(User {
            id: UserId::from(value.id),
            name,
            email,
            password,
            created_at: value.created_at,
        })
    }
}

/// Postgres 消息日志。
///
/// 每次追加在一个事务内完成：先取事务级 advisory lock，再按令牌查重，
/// 未命中时以 `MAX(sequence_id) + 1` 插入。锁在提交或回滚时释放，序列号因此连续无空洞。
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn persist(
        &self,
        idempotency_token: &IdempotencyToken,
        content: &MessageContent,
    ) -> Result<PersistOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MESSAGE_LOG_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        let existing = sqlx::query_as::<_, MessageRecord>(
            r#"SELECT sequence_id, idempotency_token, content FROM messages WHERE idempotency_token = $1"#,
        )
        .bind(idempotency_token.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if let Some(record) = existing {
            tx.commit().await.map_err(map_sqlx_err)?;
            debug!(idempotency_token = %idempotency_token, "token already persisted");
            return Ok(PersistOutcome {
                message: Message::try_from(record)?,
                is_new: false,
            });
        }

        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (sequence_id, idempotency_token, content)
            SELECT COALESCE(MAX(sequence_id), 0) + 1, $1, $2 FROM messages
            RETURNING sequence_id, idempotency_token, content
            "#,
        )
        .bind(idempotency_token.as_str())
        .bind(content.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(PersistOutcome {
            message: Message::try_from(record)?,
            is_new: true,
        })
    }

    async fn read_since(&self, after: SequenceId) -> Result<Vec<Message>, RepositoryError> {
        // 超出 BIGINT 范围的断点之后不可能还有消息
        let Ok(after) = i64::try_from(after.value()) else {
            return Ok(Vec::new());
        };

        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT sequence_id, idempotency_token, content
            FROM messages
            WHERE sequence_id > $1
            ORDER BY sequence_id ASC
            "#,
        )
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn latest_sequence(&self) -> Result<SequenceId, RepositoryError> {
        let latest: i64 =
            sqlx::query_scalar(r#"SELECT COALESCE(MAX(sequence_id), 0) FROM messages"#)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

        u64::try_from(latest)
            .map(SequenceId::new)
            .map_err(|_| invalid_data(format!("negative sequence id {latest}")))
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            INSERT INTO users (id, name, email, password_hash, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, email, password_hash, created_at
            "#,
        )
        .bind(Uuid::from(user.id))
        .bind(user.name.as_str())
        .bind(user.email.as_str())
        .bind(user.password.as_str())
        .bind(user.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        User::try_from(record)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"SELECT id, name, email, password_hash, created_at FROM users WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(User::try_from).transpose()
    }

    async fn find_by_email(&self, email: &UserEmail) -> Result<Option<User>, RepositoryError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"SELECT id, name, email, password_hash, created_at FROM users WHERE email = $1"#,
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(User::try_from).transpose()
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub message_store: Arc<PgMessageStore>,
    pub user_repository: Arc<PgUserRepository>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            message_store: Arc::new(PgMessageStore::new(pool.clone())),
            user_repository: Arc::new(PgUserRepository::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
