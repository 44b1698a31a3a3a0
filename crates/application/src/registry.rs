//! 在线连接登记表。
//!
//! 每条连接对应一个有界的出站通道，广播时逐个 `try_send`，
//! 任何一条通道写入失败（已关闭或已满）都只会让这条连接被移除，不影响其他连接。

use std::collections::HashMap;

use domain::{ConnectionId, IdempotencyToken, Message, SequenceId};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tracing::{debug, info, warn};

use crate::auth::Principal;

/// 推送给某条连接的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// 广播或补发的消息
    Message(Message),
    /// 只发给提交者的确认
    Ack {
        idempotency_token: IdempotencyToken,
        sequence_id: SequenceId,
    },
    /// 只发给提交者的错误
    Rejected(SubmissionRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Validation,
    StoreUnavailable,
}

impl RejectionReason {
    pub fn retryable(self) -> bool {
        matches!(self, RejectionReason::StoreUnavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRejection {
    pub idempotency_token: Option<String>,
    pub reason: RejectionReason,
    pub detail: String,
}

pub type OutboundSender = mpsc::Sender<OutboundEvent>;
pub type OutboundReceiver = mpsc::Receiver<OutboundEvent>;

pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// 已登记连接的句柄。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: ConnectionId,
    principal: Principal,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

#[derive(Debug, Error)]
enum ChannelSendFailure {
    #[error("outbound channel is full")]
    Full,
    #[error("outbound channel is closed")]
    Closed,
}

impl<T> From<TrySendError<T>> for ChannelSendFailure {
    fn from(value: TrySendError<T>) -> Self {
        match value {
            TrySendError::Full(_) => ChannelSendFailure::Full,
            TrySendError::Closed(_) => ChannelSendFailure::Closed,
        }
    }
}

struct RegisteredConnection {
    principal: Principal,
    channel: OutboundSender,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, RegisteredConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn admit(&self, principal: Principal, channel: OutboundSender) -> ConnectionHandle {
        let id = ConnectionId::generate();
        let handle = ConnectionHandle {
            id,
            principal: principal.clone(),
        };

        let mut connections = self.connections.write().await;
        connections.insert(id, RegisteredConnection { principal, channel });
        info!(
            connection_id = %id,
            principal = %handle.principal,
            active = connections.len(),
            "connection admitted"
        );
        handle
    }

    /// 移除连接；重复调用是安全的。返回本次调用是否真的移除了连接。
    pub async fn remove(&self, handle: &ConnectionHandle) -> bool {
        let removed = self.connections.write().await.remove(&handle.id).is_some();
        if removed {
            info!(connection_id = %handle.id, principal = %handle.principal, "connection removed");
        }
        removed
    }

    /// 向所有连接投递消息，返回成功投递的连接数。
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, connection) in connections.iter() {
                match deliver(&connection.channel, OutboundEvent::Message(message.clone())) {
                    Ok(()) => delivered += 1,
                    Err(failure) => failed.push((*id, failure)),
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.write().await;
            for (id, failure) in failed {
                if let Some(connection) = connections.remove(&id) {
                    warn!(
                        connection_id = %id,
                        principal = %connection.principal,
                        sequence_id = %message.sequence_id,
                        error = %failure,
                        "dropping connection after failed send"
                    );
                }
            }
        }

        debug!(sequence_id = %message.sequence_id, delivered, "message broadcast");
        delivered
    }

    /// 只向一条连接投递事件。连接已不存在时返回 `false`。
    pub async fn send_to(&self, handle: &ConnectionHandle, event: OutboundEvent) -> bool {
        let result = {
            let connections = self.connections.read().await;
            match connections.get(&handle.id) {
                Some(connection) => deliver(&connection.channel, event),
                None => {
                    debug!(connection_id = %handle.id, "target connection already gone");
                    return false;
                }
            }
        };

        match result {
            Ok(()) => true,
            Err(failure) => {
                warn!(connection_id = %handle.id, error = %failure, "dropping connection after failed send");
                self.connections.write().await.remove(&handle.id);
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn deliver(channel: &OutboundSender, event: OutboundEvent) -> Result<(), ChannelSendFailure> {
    channel.try_send(event).map_err(ChannelSendFailure::from)
}
