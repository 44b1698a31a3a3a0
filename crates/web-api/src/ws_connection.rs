use std::sync::Arc;

use application::{ConnectionSession, DeliveryCoordinator, SubmitRequest};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientFrame, ServerFrame};

/// 单条中继连接
///
/// 负责一条 WebSocket 的完整生命周期：
/// - 先按序写出补发消息
/// - 进入实时阶段后，同时转发出站事件与处理客户端帧
/// - 断开时从登记表移除
///
/// 同一连接的提交按到达顺序进入队列，由一个独立的工作任务逐条执行。
pub struct RelayConnection {
    coordinator: Arc<DeliveryCoordinator>,
    session: ConnectionSession,
}

type WsSender = SplitSink<WebSocket, WsMessage>;
type SubmitQueue = mpsc::Sender<SubmitRequest>;

/// 每条连接排队等待执行的提交上限。
///
/// 出站事件优先于读取客户端帧，因此一条连接自身产生的广播与确认
/// 最多为 `2 * (SUBMIT_QUEUE_CAPACITY + 2)` 条，小于默认的出站缓冲。
const SUBMIT_QUEUE_CAPACITY: usize = 16;

/// 客户端帧的处理结果
enum Incoming {
    Reply(WsMessage),
    Submit(SubmitRequest),
    Continue,
    Close,
}

impl RelayConnection {
    pub fn new(coordinator: Arc<DeliveryCoordinator>, session: ConnectionSession) -> Self {
        Self {
            coordinator,
            session,
        }
    }

    pub async fn run(mut self, socket: WebSocket) {
        let (mut sender, mut incoming) = socket.split();
        let submissions = self.spawn_submit_worker();

        if self.replay(&mut sender).await {
            self.live(&mut sender, &mut incoming, &submissions).await;
        }

        // 关闭队列后工作任务会把剩余提交执行完再退出
        drop(submissions);
        self.coordinator.disconnect(&mut self.session).await;
        info!(
            connection_id = %self.session.handle().id(),
            last_delivered = %self.session.last_delivered(),
            "websocket connection finished"
        );
    }

    /// 补发阶段不读取客户端帧。返回 `false` 表示写出失败，连接应结束。
    async fn replay(&mut self, sender: &mut WsSender) -> bool {
        let mut replayed = 0usize;
        while let Some(message) = self.session.next_replayed() {
            let frame = ServerFrame::Message {
                sequence_id: message.sequence_id,
                content: message.content.as_str().to_string(),
            };
            if !send_frame(sender, &frame).await {
                return false;
            }
            replayed += 1;
        }
        debug!(connection_id = %self.session.handle().id(), replayed, "replay delivered");
        true
    }

    async fn live(
        &mut self,
        sender: &mut WsSender,
        incoming: &mut SplitStream<WebSocket>,
        submissions: &SubmitQueue,
    ) {
        loop {
            tokio::select! {
                biased;

                event = self.session.next_event() => {
                    let Some(event) = event else {
                        // 连接已被登记表移除，例如出站通道写满
                        warn!(connection_id = %self.session.handle().id(), "connection dropped by registry");
                        break;
                    };
                    if !send_frame(sender, &ServerFrame::from(event)).await {
                        break;
                    }
                }
                message = incoming.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            debug!(error = %err, "websocket receive failed");
                            break;
                        }
                        None => break,
                    };
                    match self.handle_incoming(message) {
                        Incoming::Reply(reply) => {
                            if sender.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Incoming::Submit(request) => {
                            if submissions.send(request).await.is_err() {
                                warn!(connection_id = %self.session.handle().id(), "submit worker stopped");
                                break;
                            }
                        }
                        Incoming::Continue => {}
                        Incoming::Close => break,
                    }
                }
            }
        }
    }

    fn handle_incoming(&self, message: WsMessage) -> Incoming {
        match message {
            WsMessage::Close(_) => {
                debug!("websocket close frame received");
                Incoming::Close
            }
            WsMessage::Ping(data) => Incoming::Reply(WsMessage::Pong(data)),
            WsMessage::Pong(_) => Incoming::Continue,
            WsMessage::Binary(_) => {
                reply_frame(&ServerFrame::malformed("binary frames are not supported"))
            }
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(frame) => Incoming::Submit(SubmitRequest::from(frame)),
                Err(err) => reply_frame(&ServerFrame::malformed(err.to_string())),
            },
        }
    }

    // 工作任务与 socket 解耦，连接断开不会中断已经排队的持久化与广播
    fn spawn_submit_worker(&self) -> SubmitQueue {
        let (queue, mut pending) = mpsc::channel::<SubmitRequest>(SUBMIT_QUEUE_CAPACITY);
        let coordinator = self.coordinator.clone();
        let handle = self.session.handle().clone();

        tokio::spawn(async move {
            while let Some(request) = pending.recv().await {
                if let Err(err) = coordinator.submit(&handle, request).await {
                    debug!(connection_id = %handle.id(), error = %err, "submission failed");
                }
            }
            debug!(connection_id = %handle.id(), "submit queue drained");
        });

        queue
    }
}

fn reply_frame(frame: &ServerFrame) -> Incoming {
    match serde_json::to_string(frame) {
        Ok(json) => Incoming::Reply(WsMessage::Text(json.into())),
        Err(err) => {
            warn!(error = %err, "failed to serialize websocket frame");
            Incoming::Continue
        }
    }
}

async fn send_frame(sender: &mut WsSender, frame: &ServerFrame) -> bool {
    let payload = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize websocket frame");
            return true;
        }
    };
    sender.send(WsMessage::Text(payload.into())).await.is_ok()
}
