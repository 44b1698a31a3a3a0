//! 统一配置中心
//!
//! 加载顺序：内置默认值 -> `RELAY_CONFIG_FILE` 指定的文件（toml/yaml/yml/json）
//! -> `RELAY_` 前缀的环境变量（`__` 分隔层级，例如 `RELAY_DATABASE__URL`）。

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidateUrl};

pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG_FILE";
pub const ENV_PREFIX: &str = "RELAY_";

const DEFAULT_BCRYPT_COST: u32 = 12;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    #[validate(nested)]
    pub relay: RelayConfig,
    #[validate(nested)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    pub url: String,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    // 至少 256 位
    #[validate(length(min = 32))]
    pub secret: String,
    #[validate(range(min = 1))]
    pub expiration_hours: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    /// 每条连接出站通道的容量，写满的连接会被断开
    #[validate(range(min = 1))]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthConfig {
    #[validate(range(min = 4, max = 31))]
    pub bcrypt_cost: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
                expiration_hours: 24,
            },
            storage: StorageConfig {
                backend: StorageBackend::Postgres,
            },
            relay: RelayConfig {
                outbound_buffer: 1024,
            },
            auth: AuthConfig {
                bcrypt_cost: DEFAULT_BCRYPT_COST,
            },
        }
    }
}

impl AppConfig {
    /// 按默认值、配置文件、环境变量的顺序加载并校验。
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                figment = figment.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                figment = figment.merge(Json::file(path));
            } else {
                figment = figment.merge(Toml::file(path));
            }
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 字段级约束之外，再检查与存储后端相关的组合约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self)?;

        if self.storage.backend == StorageBackend::Postgres {
            if self.database.url.trim().is_empty() {
                return Err(ConfigError::InvalidDatabaseUrl(
                    "database url is required for the postgres backend".into(),
                ));
            }
            if !self.database.url.validate_url() {
                return Err(ConfigError::InvalidDatabaseUrl(format!(
                    "`{}` is not a valid url",
                    redact_url(&self.database.url)
                )));
            }
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// 日志与错误信息里不输出数据库密码
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://[REDACTED]{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("invalid database url: {0}")]
    InvalidDatabaseUrl(String),
}
