//! WebSocket 文本帧格式，JSON 编码，`type` 字段区分帧类型。

use application::{OutboundEvent, RejectionReason, SubmitRequest};
use domain::SequenceId;
use serde::{Deserialize, Serialize};

pub const MALFORMED_FRAME: &str = "MALFORMED_FRAME";
pub const INVALID_SUBMISSION: &str = "INVALID_SUBMISSION";
pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";

/// 客户端 -> 服务端
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Submit {
        // 缺失的字段按空串处理，交给提交校验给出 INVALID_SUBMISSION
        #[serde(default)]
        idempotency_token: String,
        #[serde(default)]
        content: String,
    },
}

impl From<ClientFrame> for SubmitRequest {
    fn from(frame: ClientFrame) -> Self {
        match frame {
            ClientFrame::Submit {
                idempotency_token,
                content,
            } => SubmitRequest {
                idempotency_token,
                content,
            },
        }
    }
}

/// 服务端 -> 客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        sequence_id: SequenceId,
        content: String,
    },
    Ack {
        idempotency_token: String,
        sequence_id: SequenceId,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        idempotency_token: Option<String>,
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerFrame {
    pub fn malformed(detail: impl Into<String>) -> Self {
        ServerFrame::Error {
            idempotency_token: None,
            code: MALFORMED_FRAME.to_string(),
            message: detail.into(),
            retryable: false,
        }
    }
}

impl From<OutboundEvent> for ServerFrame {
    fn from(event: OutboundEvent) -> Self {
        match event {
            OutboundEvent::Message(message) => ServerFrame::Message {
                sequence_id: message.sequence_id,
                content: message.content.as_str().to_string(),
            },
            OutboundEvent::Ack {
                idempotency_token,
                sequence_id,
            } => ServerFrame::Ack {
                idempotency_token: idempotency_token.as_str().to_string(),
                sequence_id,
            },
            OutboundEvent::Rejected(rejection) => {
                let code = match rejection.reason {
                    RejectionReason::Validation => INVALID_SUBMISSION,
                    RejectionReason::StoreUnavailable => STORE_UNAVAILABLE,
                };
                ServerFrame::Error {
                    idempotency_token: rejection.idempotency_token,
                    code: code.to_string(),
                    message: rejection.detail,
                    retryable: rejection.reason.retryable(),
                }
            }
        }
    }
}
