//! 主应用程序入口
//!
//! 加载配置，按存储后端装配服务，启动 Axum Web API 服务。

use std::sync::Arc;

use application::{
    services::{UserService, UserServiceDependencies},
    Clock, ConnectionRegistry, DeliveryCoordinator, InMemoryMessageStore, InMemoryUserRepository,
    MessageStore, PasswordHasher, SystemClock, UserRepository,
};
use config::{AppConfig, StorageBackend};
use infrastructure::{BcryptPasswordHasher, Infrastructure, InfrastructureConfig};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtAuthenticator, JwtService};

struct Storage {
    message_store: Arc<dyn MessageStore>,
    user_repository: Arc<dyn UserRepository>,
    password_hasher: Arc<dyn PasswordHasher>,
}

async fn build_storage(config: &AppConfig) -> anyhow::Result<Storage> {
    match config.storage.backend {
        StorageBackend::Postgres => {
            let infrastructure = Infrastructure::connect(InfrastructureConfig {
                database_url: config.database.url.clone(),
                max_connections: config.database.max_connections,
                bcrypt_cost: config.auth.bcrypt_cost,
            })
            .await?;
            Ok(Storage {
                message_store: infrastructure.message_store(),
                user_repository: infrastructure.user_repository(),
                password_hasher: infrastructure.password_hasher_trait(),
            })
        }
        StorageBackend::Memory => {
            tracing::warn!("使用内存存储，重启后消息与账号都会丢失");
            Ok(Storage {
                message_store: Arc::new(InMemoryMessageStore::new()),
                user_repository: Arc::new(InMemoryUserRepository::new()),
                password_hasher: Arc::new(BcryptPasswordHasher::new(config.auth.bcrypt_cost)),
            })
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听 Ctrl-C 信号");
    }
    tracing::info!("收到关闭信号，开始优雅退出");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        backend = ?config.storage.backend,
        outbound_buffer = config.relay.outbound_buffer,
        "配置加载完成"
    );

    let storage = build_storage(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let user_service = UserService::new(UserServiceDependencies {
        user_repository: storage.user_repository.clone(),
        password_hasher: storage.password_hasher,
        clock,
    });

    let coordinator = DeliveryCoordinator::new(
        storage.message_store,
        Arc::new(ConnectionRegistry::new()),
        config.relay.outbound_buffer,
    );

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let authenticator = Arc::new(JwtAuthenticator::new(
        jwt_service.clone(),
        storage.user_repository,
    ));

    let state = AppState::new(
        Arc::new(user_service),
        Arc::new(coordinator),
        authenticator,
        jwt_service,
    );

    // 启动 Web 服务器
    let app = router(state);
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!("消息中继服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
