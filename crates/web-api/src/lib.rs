//! Web API 层。
//!
//! 提供 Axum 路由：账号注册登录走 HTTP，消息中继走 WebSocket，均委托给应用层。

mod auth;
mod error;
pub mod protocol;
mod routes;
mod state;
mod ws_connection;

pub use auth::{request_credentials, Claims, JwtAuthenticator, JwtService, LoginResponse};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
