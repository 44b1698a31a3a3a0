use axum::{
    extract::{rejection::QueryRejection, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use application::services::{AuthenticateUserRequest, RegisterUserRequest};
use domain::{SequenceId, User};

use crate::{
    auth::{request_credentials, LoginResponse},
    error::ApiError,
    state::AppState,
    ws_connection::RelayConnection,
};

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    name: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
    resume_point: Option<u64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register_user))
        .route("/auth/login", post(login_user))
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn register_user(
    State(state): State<AppState>,
    Json(payload): Json<RegisterPayload>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state
        .user_service
        .register(RegisterUserRequest {
            name: payload.name,
            email: payload.email,
            password: payload.password,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_user(
    State(state): State<AppState>,
    Json(payload): Json<LoginPayload>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .user_service
        .authenticate(AuthenticateUserRequest {
            email: payload.email,
            password: payload.password,
        })
        .await?;
    let token = state.jwt_service.generate_token(&user)?;

    Ok(Json(LoginResponse { user, token }))
}

/// 认证与补发准备都在升级之前完成，失败时直接返回 HTTP 错误。
async fn websocket_upgrade(
    State(state): State<AppState>,
    query: Result<Query<WsQuery>, QueryRejection>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let credentials = request_credentials(&headers, query.token);
    let principal = state.authenticator.authenticate(&credentials).await?;

    let session = state
        .coordinator
        .connect(principal, query.resume_point.map(SequenceId::new))
        .await?;

    let registry = state.coordinator.registry().clone();
    let handle = session.handle().clone();
    info!(connection_id = %handle.id(), principal = %handle.principal(), "upgrading websocket");

    Ok(ws
        .on_failed_upgrade(move |err| {
            warn!(connection_id = %handle.id(), error = %err, "websocket upgrade failed");
            tokio::spawn(async move {
                registry.remove(&handle).await;
            });
        })
        .on_upgrade(move |socket| RelayConnection::new(state.coordinator, session).run(socket)))
}
