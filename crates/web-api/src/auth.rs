//! JWT 认证模块
//!
//! 提供 JWT token 生成、验证，以及基于 JWT 的 [`Authenticator`] 实现。

use std::sync::Arc;

use application::{AuthError, Authenticator, Credentials, Principal, UserRepository};
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use config::JwtConfig;
use domain::{User, UserId};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub name: String,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user: &User) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            user_id: Uuid::from(user.id),
            name: user.name.as_str().to_string(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|err| {
            ApiError::internal_server_error(format!("token generation failed: {}", err))
        })
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| AuthError::InvalidCredentials(err.to_string()))
    }
}

/// 取连接请求中的凭据：优先使用查询参数里的 token，其次是 `Authorization: Bearer` 头。
pub fn request_credentials(headers: &HeaderMap, query_token: Option<String>) -> Credentials {
    if let Some(token) = query_token.filter(|token| !token.trim().is_empty()) {
        return Credentials::bearer(token);
    }

    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    Credentials::bearer(header_token)
}

/// 校验 JWT 后再到用户仓储确认用户仍然存在，每次认证都会查库。
pub struct JwtAuthenticator {
    jwt_service: Arc<JwtService>,
    user_repository: Arc<dyn UserRepository>,
}

impl JwtAuthenticator {
    pub fn new(jwt_service: Arc<JwtService>, user_repository: Arc<dyn UserRepository>) -> Self {
        Self {
            jwt_service,
            user_repository,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        if credentials.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let claims = self.jwt_service.verify_token(credentials.as_str())?;
        let user = self
            .user_repository
            .find_by_id(UserId::from(claims.user_id))
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?
            .ok_or(AuthError::UnknownPrincipal)?;

        Ok(Principal::new(user.id, user.name.as_str()))
    }
}

/// 登录响应结构
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: User,
    pub token: String,
}
