//! 应用层实现。
//!
//! 围绕消息日志提供投递协调：幂等持久化、按序广播、重连补发，
//! 并通过 trait 抽象外部适配器（消息存储、用户仓储、密码哈希、认证）。

pub mod auth;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod registry;
pub mod repository;
pub mod services;
pub mod store;

pub use auth::{
    AuthError, Authenticator, Credentials, PasswordHasher, PasswordHasherError, Principal,
};
pub use clock::{Clock, SystemClock};
pub use coordinator::{
    ConnectionSession, ConnectionState, DeliveryCoordinator, SubmitReceipt, SubmitRequest,
};
pub use error::ApplicationError;
pub use memory::{InMemoryMessageStore, InMemoryUserRepository};
pub use registry::{
    outbound_channel, ConnectionHandle, ConnectionRegistry, OutboundEvent, OutboundReceiver,
    OutboundSender, RejectionReason, SubmissionRejection,
};
pub use repository::UserRepository;
pub use services::{
    AuthenticateUserRequest, RegisterUserRequest, UserService, UserServiceDependencies,
};
pub use store::{MessageStore, PersistOutcome};
