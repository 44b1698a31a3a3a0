use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{
    services::{UserService, UserServiceDependencies},
    ConnectionRegistry, DeliveryCoordinator, InMemoryMessageStore, InMemoryUserRepository,
    SystemClock,
};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use infrastructure::BcryptPasswordHasher;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::{net::TcpListener, net::TcpStream, sync::oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router as build_router_fn, AppState, JwtAuthenticator, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_router() -> Router {
    let user_repository = Arc::new(InMemoryUserRepository::new());
    let user_service = UserService::new(UserServiceDependencies {
        user_repository: user_repository.clone(),
        password_hasher: Arc::new(BcryptPasswordHasher::new(4)),
        clock: Arc::new(SystemClock),
    });

    let coordinator = DeliveryCoordinator::new(
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(ConnectionRegistry::new()),
        64,
    );

    let jwt_service = Arc::new(JwtService::new(JwtConfig {
        secret: "test-secret-key-with-at-least-32-characters".to_string(),
        expiration_hours: 1,
    }));
    let authenticator = Arc::new(JwtAuthenticator::new(jwt_service.clone(), user_repository));

    let state = AppState::new(
        Arc::new(user_service),
        Arc::new(coordinator),
        authenticator,
        jwt_service,
    );

    build_router_fn(state)
}

/// 在随机端口启动服务，返回地址与关闭信号。
pub async fn spawn_server() -> (SocketAddr, oneshot::Sender<()>) {
    let router = build_router();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    (addr, shutdown_tx)
}

/// 注册并登录，返回 token。
pub async fn register_and_login(client: &Client, addr: SocketAddr, name: &str) -> String {
    let email = format!("{name}@example.com");
    let response = client
        .post(format!("http://{addr}/api/v1/auth/register"))
        .json(&json!({"name": name, "email": email, "password": "secret"}))
        .send()
        .await
        .expect("register");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let login = client
        .post(format!("http://{addr}/api/v1/auth/login"))
        .json(&json!({"email": email, "password": "secret"}))
        .send()
        .await
        .expect("login")
        .json::<Value>()
        .await
        .expect("login json");
    login["token"].as_str().expect("token").to_string()
}

pub async fn connect(addr: SocketAddr, token: &str, resume_point: Option<u64>) -> WsClient {
    let mut url = format!("ws://{addr}/api/v1/ws?token={token}");
    if let Some(resume_point) = resume_point {
        url.push_str(&format!("&resume_point={resume_point}"));
    }
    let (stream, _) = connect_async(url).await.expect("websocket connect");
    stream
}

pub async fn submit(ws: &mut WsClient, token: &str, content: &str) {
    let frame = json!({"type": "submit", "idempotency_token": token, "content": content});
    ws.send(TungsteniteMessage::text(frame.to_string()))
        .await
        .expect("send submit");
}

/// 读取下一个 JSON 文本帧，跳过控制帧。
pub async fn next_frame(ws: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let TungsteniteMessage::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("frame json");
        }
    }
}

/// 在短时间内没有新的文本帧。
pub async fn assert_silent(ws: &mut WsClient) {
    let quiet = Duration::from_millis(100);
    while let Ok(Some(Ok(message))) = tokio::time::timeout(quiet, ws.next()).await {
        if let TungsteniteMessage::Text(text) = message {
            panic!("unexpected frame: {}", text.as_str());
        }
    }
}
