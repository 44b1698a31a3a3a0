//! 投递流程集成测试
//!
//! 使用内存存储驱动完整的连接、提交、广播与重连补发流程。

use std::{sync::Arc, time::Duration};

use application::{
    ApplicationError, ConnectionRegistry, ConnectionSession, ConnectionState, DeliveryCoordinator,
    InMemoryMessageStore, MessageStore, OutboundEvent, PersistOutcome, Principal, SubmitRequest,
};
use async_trait::async_trait;
use domain::{
    IdempotencyToken, Message, MessageContent, RepositoryError, SequenceId, UserId,
};
use tokio::time::timeout;
use uuid::Uuid;

const QUIET: Duration = Duration::from_millis(50);
const PATIENCE: Duration = Duration::from_secs(5);

struct TestRelay {
    store: Arc<InMemoryMessageStore>,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<DeliveryCoordinator>,
}

impl TestRelay {
    fn new() -> Self {
        let store = Arc::new(InMemoryMessageStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let coordinator = Arc::new(DeliveryCoordinator::new(
            store.clone(),
            registry.clone(),
            1024,
        ));
        Self {
            store,
            registry,
            coordinator,
        }
    }

    /// 连接并消费完补发，返回补发的序列号。
    async fn connect_live(
        &self,
        name: &str,
        resume_point: Option<u64>,
    ) -> (ConnectionSession, Vec<u64>) {
        let mut session = self
            .coordinator
            .connect(principal(name), resume_point.map(SequenceId::new))
            .await
            .unwrap();
        let mut replayed = Vec::new();
        while let Some(message) = session.next_replayed() {
            replayed.push(message.sequence_id.value());
        }
        assert_eq!(session.state(), ConnectionState::Live);
        (session, replayed)
    }
}

fn principal(name: &str) -> Principal {
    Principal::new(UserId::from(Uuid::new_v4()), name)
}

fn request(token: &str, content: &str) -> SubmitRequest {
    SubmitRequest {
        idempotency_token: token.to_string(),
        content: content.to_string(),
    }
}

async fn next_message(session: &mut ConnectionSession) -> Message {
    loop {
        match timeout(PATIENCE, session.next_event()).await {
            Ok(Some(OutboundEvent::Message(message))) => return message,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("connection closed while waiting for a message"),
            Err(_) => panic!("timed out waiting for a message"),
        }
    }
}

async fn next_ack(session: &mut ConnectionSession) -> (String, u64) {
    loop {
        match timeout(PATIENCE, session.next_event()).await {
            Ok(Some(OutboundEvent::Ack {
                idempotency_token,
                sequence_id,
            })) => return (idempotency_token.as_str().to_string(), sequence_id.value()),
            Ok(Some(_)) => continue,
            Ok(None) => panic!("connection closed while waiting for an ack"),
            Err(_) => panic!("timed out waiting for an ack"),
        }
    }
}

async fn assert_no_message(session: &mut ConnectionSession) {
    loop {
        match timeout(QUIET, session.next_event()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(OutboundEvent::Message(message))) => {
                panic!("unexpected message {}", message.sequence_id)
            }
            Ok(Some(_)) => continue,
        }
    }
}

#[tokio::test]
async fn retry_is_acknowledged_without_second_broadcast() {
    let relay = TestRelay::new();
    let (mut a, _) = relay.connect_live("a", None).await;
    let (mut b, _) = relay.connect_live("b", None).await;

    let first = relay
        .coordinator
        .submit(a.handle(), request("t1", "hi"))
        .await
        .unwrap();
    assert_eq!(first.sequence_id, SequenceId::new(1));
    assert!(!first.duplicate);

    let seen = next_message(&mut b).await;
    assert_eq!(seen.sequence_id, SequenceId::new(1));
    assert_eq!(seen.content.as_str(), "hi");
    assert_eq!(next_message(&mut a).await.sequence_id, SequenceId::new(1));
    assert_eq!(next_ack(&mut a).await, ("t1".to_string(), 1));

    let retry = relay
        .coordinator
        .submit(a.handle(), request("t1", "hi"))
        .await
        .unwrap();
    assert_eq!(retry.sequence_id, SequenceId::new(1));
    assert!(retry.duplicate);
    assert_eq!(next_ack(&mut a).await, ("t1".to_string(), 1));

    assert_no_message(&mut b).await;
    assert_eq!(relay.store.len().await, 1);
}

#[tokio::test]
async fn reconnect_replays_only_what_was_missed() {
    let relay = TestRelay::new();
    let (a, _) = relay.connect_live("a", None).await;
    relay
        .coordinator
        .submit(a.handle(), request("t1", "hi"))
        .await
        .unwrap();

    let (_, replayed) = relay.connect_live("c", Some(1)).await;
    assert!(replayed.is_empty());

    let (_, replayed) = relay.connect_live("c", None).await;
    assert_eq!(replayed, vec![1]);

    let (_, replayed) = relay.connect_live("c", Some(0)).await;
    assert_eq!(replayed, vec![1]);
}

#[tokio::test]
async fn replay_then_live_has_no_gaps_or_duplicates() {
    let relay = TestRelay::new();
    let (writer, _) = relay.connect_live("writer", None).await;
    for i in 1..=5 {
        relay
            .coordinator
            .submit(writer.handle(), request(&format!("t{i}"), &format!("m{i}")))
            .await
            .unwrap();
    }

    let mut late = relay
        .coordinator
        .connect(principal("late"), Some(SequenceId::new(2)))
        .await
        .unwrap();
    assert_eq!(late.state(), ConnectionState::Replaying);

    // 补发尚未消费时到达的实时消息排在补发之后
    for i in 6..=7 {
        relay
            .coordinator
            .submit(writer.handle(), request(&format!("t{i}"), &format!("m{i}")))
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 3..=7 {
        received.push(next_message(&mut late).await.sequence_id.value());
    }
    assert_eq!(received, vec![3, 4, 5, 6, 7]);
    assert_eq!(late.last_delivered(), SequenceId::new(7));
    assert_no_message(&mut late).await;
}

/// 在补发读取之前插入一条消息并广播，模拟登记与读取之间的并发提交。
struct RacingStore {
    inner: InMemoryMessageStore,
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl MessageStore for RacingStore {
    async fn persist(
        &self,
        idempotency_token: &IdempotencyToken,
        content: &MessageContent,
    ) -> Result<PersistOutcome, RepositoryError> {
        self.inner.persist(idempotency_token, content).await
    }

    async fn read_since(&self, after: SequenceId) -> Result<Vec<Message>, RepositoryError> {
        let next = self.inner.latest_sequence().await?.next();
        let outcome = self
            .inner
            .persist(
                &IdempotencyToken::parse(format!("racing-{next}")).unwrap(),
                &MessageContent::new("raced").unwrap(),
            )
            .await?;
        self.registry.broadcast(&outcome.message).await;
        self.inner.read_since(after).await
    }

    async fn latest_sequence(&self) -> Result<SequenceId, RepositoryError> {
        self.inner.latest_sequence().await
    }
}

#[tokio::test]
async fn message_in_both_replay_and_live_stream_is_delivered_once() {
    let registry = Arc::new(ConnectionRegistry::new());
    let store = Arc::new(RacingStore {
        inner: InMemoryMessageStore::new(),
        registry: registry.clone(),
    });
    let coordinator = DeliveryCoordinator::new(store, registry, 64);

    let mut session = coordinator.connect(principal("c"), None).await.unwrap();

    assert_eq!(next_message(&mut session).await.sequence_id, SequenceId::new(1));
    assert_no_message(&mut session).await;
}

#[tokio::test]
async fn disconnecting_mid_submit_still_broadcasts() {
    let relay = TestRelay::new();
    let (mut a, _) = relay.connect_live("a", None).await;
    let (mut b, _) = relay.connect_live("b", None).await;

    let handle = a.handle().clone();
    let coordinator = relay.coordinator.clone();
    let submission =
        tokio::spawn(async move { coordinator.submit(&handle, request("t1", "bye")).await });
    relay.coordinator.disconnect(&mut a).await;

    let receipt = submission.await.unwrap().unwrap();
    assert_eq!(receipt.sequence_id, SequenceId::new(1));
    assert_eq!(next_message(&mut b).await.content.as_str(), "bye");
    assert_eq!(a.state(), ConnectionState::Closed);
    assert_eq!(relay.registry.len().await, 1);
}

#[tokio::test]
async fn validation_errors_stay_with_the_originator() {
    let relay = TestRelay::new();
    let (mut a, _) = relay.connect_live("a", None).await;
    let (mut b, _) = relay.connect_live("b", None).await;

    let err = relay
        .coordinator
        .submit(a.handle(), request("t1", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplicationError::Domain(_)));

    match timeout(PATIENCE, a.next_event()).await {
        Ok(Some(OutboundEvent::Rejected(rejection))) => {
            assert!(!rejection.reason.retryable());
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(timeout(QUIET, b.next_event()).await.is_err());
    assert!(relay.store.is_empty().await);
}

#[tokio::test]
async fn concurrent_retries_broadcast_once() {
    let relay = TestRelay::new();
    let (mut watcher, _) = relay.connect_live("watcher", None).await;
    let (sender, _) = relay.connect_live("sender", None).await;

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let coordinator = relay.coordinator.clone();
            let handle = sender.handle().clone();
            tokio::spawn(async move { coordinator.submit(&handle, request("shared", "hi")).await })
        })
        .collect();

    let receipts: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(receipts.iter().filter(|r| !r.duplicate).count(), 1);
    assert!(receipts
        .iter()
        .all(|r| r.sequence_id == SequenceId::new(1)));
    assert_eq!(next_message(&mut watcher).await.sequence_id, SequenceId::new(1));
    assert_no_message(&mut watcher).await;
}

#[tokio::test]
async fn concurrent_submissions_arrive_in_sequence_order() {
    let relay = TestRelay::new();
    let (mut watcher, _) = relay.connect_live("watcher", None).await;
    let senders: Vec<_> = {
        let mut senders = Vec::new();
        for i in 0..4 {
            senders.push(relay.connect_live(&format!("sender-{i}"), None).await.0);
        }
        senders
    };

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let coordinator = relay.coordinator.clone();
            let handle = senders[i % senders.len()].handle().clone();
            tokio::spawn(async move {
                coordinator
                    .submit(&handle, request(&format!("token-{i}"), "x"))
                    .await
            })
        })
        .collect();
    for joined in futures::future::join_all(tasks).await {
        assert!(!joined.unwrap().unwrap().duplicate);
    }

    let mut received = Vec::new();
    for _ in 0..40 {
        received.push(next_message(&mut watcher).await.sequence_id.value());
    }
    assert_eq!(received, (1..=40).collect::<Vec<_>>());
}
