//! 投递协调器
//!
//! 负责连接的补发与消息提交：
//! - 连接时先登记到 [`ConnectionRegistry`]，再从存储读取断点之后的消息，
//!   补发完成之前到达的实时消息留在连接自己的通道里，按序列号去重后再转发；
//! - 提交时先幂等持久化，只有新消息才广播；持久化与广播在同一条串行的追加路径上完成，
//!   因此所有连接看到的实时消息顺序与序列号顺序一致。

use std::{collections::VecDeque, sync::Arc};

use domain::{IdempotencyToken, Message, MessageContent, SequenceId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    auth::Principal,
    error::ApplicationError,
    registry::{
        outbound_channel, ConnectionHandle, ConnectionRegistry, OutboundEvent, OutboundReceiver,
        RejectionReason, SubmissionRejection,
    },
    store::{MessageStore, PersistOutcome},
};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub idempotency_token: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub sequence_id: SequenceId,
    /// 令牌此前已被持久化，本次提交没有产生新消息
    pub duplicate: bool,
}

/// 单条连接的生命周期：`Connecting -> Replaying -> Live -> Closed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Replaying,
    Live,
    Closed,
}

pub struct DeliveryCoordinator {
    store: Arc<dyn MessageStore>,
    registry: Arc<ConnectionRegistry>,
    outbound_capacity: usize,
    // 已广播的最大序列号；首次提交时从存储加载。持有这把锁即独占追加路径。
    broadcast_watermark: Mutex<Option<SequenceId>>,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<ConnectionRegistry>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            store,
            registry,
            outbound_capacity: outbound_capacity.max(1),
            broadcast_watermark: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 登记一条已认证的连接并准备补发。
    ///
    /// `resume_point` 是客户端声称已收到的最大序列号，缺省表示从头开始。
    /// 读取存储失败时连接会被移除并返回 [`ApplicationError::StoreUnavailable`]。
    pub async fn connect(
        &self,
        principal: Principal,
        resume_point: Option<SequenceId>,
    ) -> Result<ConnectionSession, ApplicationError> {
        let requested = resume_point.unwrap_or(SequenceId::ZERO);
        let (sender, receiver) = outbound_channel(self.outbound_capacity);
        let handle = self.registry.admit(principal, sender).await;

        let replay = match self.load_replay(requested).await {
            Ok(replay) => replay,
            Err(err) => {
                warn!(connection_id = %handle.id(), error = %err, "replay failed, closing connection");
                self.registry.remove(&handle).await;
                return Err(err);
            }
        };

        info!(
            connection_id = %handle.id(),
            principal = %handle.principal(),
            resume_point = %requested,
            replay = replay.messages.len(),
            "connection replaying"
        );

        Ok(ConnectionSession {
            handle,
            state: ConnectionState::Replaying,
            replay: replay.messages.into(),
            live: receiver,
            last_delivered: replay.start,
        })
    }

    async fn load_replay(&self, requested: SequenceId) -> Result<Replay, ApplicationError> {
        let latest = self
            .store
            .latest_sequence()
            .await
            .map_err(ApplicationError::StoreUnavailable)?;
        // 断点超过日志末尾时（例如存储被重建），从末尾开始，避免过滤掉之后的新消息
        let start = requested.min(latest);
        let messages = self
            .store
            .read_since(start)
            .await
            .map_err(ApplicationError::StoreUnavailable)?;
        Ok(Replay { start, messages })
    }

    /// 处理一次提交，并把确认或错误发回提交者。
    ///
    /// 已被持久化的消息不会因为提交者断开而丢失，前提是调用方不取消这个 future；
    /// 网络层应在独立任务中调用本方法。
    pub async fn submit(
        &self,
        handle: &ConnectionHandle,
        request: SubmitRequest,
    ) -> Result<SubmitReceipt, ApplicationError> {
        let raw_token = request.idempotency_token.clone();
        let (token, content) = match validate(request) {
            Ok(parts) => parts,
            Err(err) => {
                debug!(connection_id = %handle.id(), error = %err, "submission rejected");
                self.reject(handle, raw_token, RejectionReason::Validation, &err)
                    .await;
                return Err(err);
            }
        };

        let outcome = match self.append(&token, &content).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    connection_id = %handle.id(),
                    idempotency_token = %token,
                    error = %err,
                    "persist failed"
                );
                self.reject(handle, raw_token, RejectionReason::StoreUnavailable, &err)
                    .await;
                return Err(err);
            }
        };

        let receipt = SubmitReceipt {
            sequence_id: outcome.sequence_id(),
            duplicate: !outcome.is_new,
        };
        if receipt.duplicate {
            debug!(
                idempotency_token = %token,
                sequence_id = %receipt.sequence_id,
                "duplicate submission acknowledged"
            );
        }

        self.registry
            .send_to(
                handle,
                OutboundEvent::Ack {
                    idempotency_token: token,
                    sequence_id: receipt.sequence_id,
                },
            )
            .await;

        Ok(receipt)
    }

    /// 连接进入 `Closed` 并从登记表移除。可重复调用。
    pub async fn disconnect(&self, session: &mut ConnectionSession) {
        session.state = ConnectionState::Closed;
        if self.registry.remove(&session.handle).await {
            info!(
                connection_id = %session.handle.id(),
                last_delivered = %session.last_delivered,
                "connection closed"
            );
        }
    }

    async fn append(
        &self,
        token: &IdempotencyToken,
        content: &MessageContent,
    ) -> Result<PersistOutcome, ApplicationError> {
        let mut watermark_slot = self.broadcast_watermark.lock().await;
        let watermark = match *watermark_slot {
            Some(watermark) => watermark,
            None => {
                let latest = self
                    .store
                    .latest_sequence()
                    .await
                    .map_err(ApplicationError::StoreUnavailable)?;
                *watermark_slot = Some(latest);
                latest
            }
        };

        let outcome = self
            .store
            .persist(token, content)
            .await
            .map_err(ApplicationError::StoreUnavailable)?;

        let sequence_id = outcome.sequence_id();
        if sequence_id > watermark {
            if outcome.is_new && sequence_id == watermark.next() {
                self.registry.broadcast(&outcome.message).await;
            } else {
                self.fill_gap(watermark, &outcome).await;
            }
            *watermark_slot = Some(sequence_id);
        }

        Ok(outcome)
    }

    // 某次持久化已提交但调用方收到了错误时，日志里会有未广播的消息；按序补上。
    async fn fill_gap(&self, watermark: SequenceId, outcome: &PersistOutcome) {
        let upper = outcome.sequence_id();
        match self.store.read_since(watermark).await {
            Ok(missed) => {
                warn!(from = %watermark, to = %upper, "broadcasting messages missed by the live stream");
                for message in missed.iter().filter(|m| m.sequence_id <= upper) {
                    self.registry.broadcast(message).await;
                }
            }
            Err(err) => {
                warn!(from = %watermark, to = %upper, error = %err, "gap fill failed, broadcasting current message only");
                self.registry.broadcast(&outcome.message).await;
            }
        }
    }

    async fn reject(
        &self,
        handle: &ConnectionHandle,
        idempotency_token: String,
        reason: RejectionReason,
        err: &ApplicationError,
    ) {
        let rejection = SubmissionRejection {
            idempotency_token: Some(idempotency_token).filter(|token| !token.is_empty()),
            reason,
            detail: err.to_string(),
        };
        self.registry
            .send_to(handle, OutboundEvent::Rejected(rejection))
            .await;
    }
}

struct Replay {
    start: SequenceId,
    messages: Vec<Message>,
}

fn validate(
    request: SubmitRequest,
) -> Result<(IdempotencyToken, MessageContent), ApplicationError> {
    let token = IdempotencyToken::parse(request.idempotency_token)?;
    let content = MessageContent::new(request.content)?;
    Ok((token, content))
}

/// 单条连接的出站视图：先按序交付补发消息，再转发实时事件。
///
/// 同一个序列号在一次会话中最多交付一次，交付顺序单调不减。
pub struct ConnectionSession {
    handle: ConnectionHandle,
    state: ConnectionState,
    replay: VecDeque<Message>,
    live: OutboundReceiver,
    last_delivered: SequenceId,
}

impl ConnectionSession {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_delivered(&self) -> SequenceId {
        self.last_delivered
    }

    /// 取下一条补发消息；补发结束后连接进入 `Live` 并返回 `None`。
    pub fn next_replayed(&mut self) -> Option<Message> {
        if self.state != ConnectionState::Replaying {
            return None;
        }
        while let Some(message) = self.replay.pop_front() {
            if message.sequence_id > self.last_delivered {
                self.last_delivered = message.sequence_id;
                return Some(message);
            }
        }
        self.state = ConnectionState::Live;
        None
    }

    /// 取下一个出站事件。补发未完成时先返回补发消息。
    ///
    /// 可以在 `tokio::select!` 中使用：等待的部分只有通道接收。
    /// 连接被移除后返回 `None`，状态变为 `Closed`。
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        if let Some(message) = self.next_replayed() {
            return Some(OutboundEvent::Message(message));
        }

        loop {
            if self.state == ConnectionState::Closed {
                return None;
            }
            match self.live.recv().await {
                Some(OutboundEvent::Message(message)) => {
                    if message.sequence_id <= self.last_delivered {
                        debug!(
                            connection_id = %self.handle.id(),
                            sequence_id = %message.sequence_id,
                            "skipping message already delivered by replay"
                        );
                        continue;
                    }
                    self.last_delivered = message.sequence_id;
                    return Some(OutboundEvent::Message(message));
                }
                Some(event) => return Some(event),
                None => {
                    self.state = ConnectionState::Closed;
                    return None;
                }
            }
        }
    }
}
