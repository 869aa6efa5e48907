use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    broker::{Broker, EventReceiver, Membership},
    store::{self, StoreError},
};

use super::msg::{self, Delivery, Posted};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorizing,
    Joined,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Rejected,
    ClientClosed,
    TransportError,
    SlowConsumer,
    ServerShutdown,
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("anonymous connection")]
    Anonymous,

    #[error("not a participant")]
    NotParticipant,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error sent back to the sending connection only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub error: &'static str,
    pub message_id: Option<Uuid>,
}

impl Reply {
    fn not_saved() -> Self {
        Self { error: "message could not be saved", message_id: None }
    }

    fn degraded(message_id: Uuid) -> Self {
        Self { error: "message saved but live delivery failed", message_id: Some(message_id) }
    }
}

/// One client's chat session in one room.
///
/// The identity is fixed at construction and the participant check runs
/// once, in [`Connection::open`]. Room membership is held until
/// [`Connection::close`], which runs at most once and is also invoked on drop.
pub struct Connection {
    id: Uuid,
    room_id: Uuid,
    user_id: Option<Uuid>,
    state: ConnectionState,
    db_pool: SqlitePool,
    broker: Arc<dyn Broker>,
    membership: Option<Membership>,
    events: Option<EventReceiver>,
}

impl Connection {
    pub fn new(db_pool: SqlitePool, broker: Arc<dyn Broker>, user_id: Option<Uuid>, room_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            state: ConnectionState::Connecting,
            db_pool,
            broker,
            membership: None,
            events: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn open(&mut self, queue_capacity: usize) -> Result<(), OpenError> {
        let Some(user_id) = self.user_id else {
            self.close(CloseReason::Rejected);
            return Err(OpenError::Anonymous);
        };

        self.state = ConnectionState::Authorizing;
        match store::is_participant(&self.db_pool, self.room_id, user_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.close(CloseReason::Rejected);
                return Err(OpenError::NotParticipant);
            }
            Err(err) => {
                self.close(CloseReason::Rejected);
                return Err(err.into());
            }
        }

        let (membership, events) = Membership::join(self.broker.clone(), self.room_id, queue_capacity);
        self.membership = Some(membership);
        self.events = Some(events);
        self.state = ConnectionState::Joined;

        tracing::info!(connection = %self.id, room_id = %self.room_id, %user_id, "joined room");
        Ok(())
    }

    /// Hands out the queue of room events; available once after joining.
    pub fn take_events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    /// Handles one client frame. Malformed or blank frames are dropped.
    pub async fn receive(&mut self, raw: &str) -> Option<Reply> {
        if self.state != ConnectionState::Joined {
            return None;
        }
        let user_id = self.user_id?;
        let content = msg::parse_inbound(raw)?;

        match msg::send_msg(&self.db_pool, self.broker.as_ref(), self.room_id, user_id, &content).await {
            Ok(Posted { delivery: Delivery::Delivered(_), .. }) => None,
            Ok(Posted { delivery: Delivery::Degraded(_), message, .. }) => Some(Reply::degraded(message.id)),
            Err(err) => {
                tracing::warn!(connection = %self.id, room_id = %self.room_id, error = %err, "failed to save message");
                Some(Reply::not_saved())
            }
        }
    }

    /// Leaves the room and moves to `Closed`. Returns `false` if already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }

        let was_joined = self.state == ConnectionState::Joined;
        if let Some(membership) = self.membership.take() {
            membership.leave();
        }
        self.events = None;
        self.state = ConnectionState::Closed;

        if was_joined {
            tracing::info!(connection = %self.id, room_id = %self.room_id, ?reason, "left room");
        } else {
            tracing::debug!(connection = %self.id, room_id = %self.room_id, ?reason, "connection refused");
        }
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(CloseReason::Dropped);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::{
        broker::{BrokerError, EventSender, LocalBroker, MemberId},
        profiles::{register, NewProfile, Role},
        rooms::ChatEvent,
        store::{create_conversation, list_messages, NewConversation},
    };

    struct Fixture {
        db_pool: SqlitePool,
        broker: Arc<dyn Broker>,
        room: Uuid,
        ana: Uuid,
        ben: Uuid,
        outsider: Uuid,
    }

    async fn user(db_pool: &SqlitePool, username: &str, first: &str, last: &str) -> Uuid {
        register(db_pool, NewProfile {
            username: username.to_owned(),
            first_name: first.to_owned(),
            last_name: last.to_owned(),
            enrollment_number: format!("EN-{username}"),
            role: Role::Student,
        })
        .await
        .unwrap()
        .id
    }

    async fn fixture_with(broker: Arc<dyn Broker>) -> Fixture {
        let db_pool = crate::db::memory().await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "Lima").await;
        let ben = user(&db_pool, "ben", "Ben", "Okafor").await;
        let outsider = user(&db_pool, "eve", "Eve", "").await;
        let room = create_conversation(&db_pool, ana, NewConversation::Direct { with: ben })
            .await
            .unwrap()
            .conversation
            .id;

        Fixture { db_pool, broker, room, ana, ben, outsider }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(LocalBroker::new())).await
    }

    impl Fixture {
        fn connection(&self, user_id: Option<Uuid>) -> Connection {
            Connection::new(self.db_pool.clone(), self.broker.clone(), user_id, self.room)
        }

        async fn stored(&self) -> usize {
            list_messages(&self.db_pool, self.room, 1, 50).await.unwrap().messages.len()
        }
    }

    #[tokio::test]
    async fn anonymous_is_rejected_without_joining() {
        let fx = fixture().await;
        let mut conn = fx.connection(None);

        assert!(matches!(conn.open(8).await, Err(OpenError::Anonymous)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(fx.broker.members(fx.room), 0);
        assert!(conn.take_events().is_none());
    }

    #[tokio::test]
    async fn non_participant_is_rejected_without_joining() {
        let fx = fixture().await;
        let mut conn = fx.connection(Some(fx.outsider));

        assert!(matches!(conn.open(8).await, Err(OpenError::NotParticipant)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(fx.broker.members(fx.room), 0);
    }

    #[tokio::test]
    async fn message_reaches_every_member_and_history() {
        let fx = fixture().await;
        let mut ana = fx.connection(Some(fx.ana));
        let mut ben = fx.connection(Some(fx.ben));
        ana.open(8).await.unwrap();
        ben.open(8).await.unwrap();
        assert_eq!(ana.state(), ConnectionState::Joined);
        assert_eq!(fx.broker.members(fx.room), 2);

        let mut ana_events = ana.take_events().unwrap();
        let mut ben_events = ben.take_events().unwrap();

        assert_eq!(ana.receive(r#"{"message":" hello "}"#).await, None);

        let seen_by_ana = ana_events.recv().await.unwrap();
        let seen_by_ben = ben_events.recv().await.unwrap();
        assert_eq!(seen_by_ana, seen_by_ben);
        assert_eq!(seen_by_ben.message, "hello");
        assert_eq!(seen_by_ben.sender_id, fx.ana);
        assert_eq!(seen_by_ben.sender_name, "Ana Lima");
        assert_eq!(seen_by_ben.sender_initials, "AL");

        let history = list_messages(&fx.db_pool, fx.room, 1, 50).await.unwrap().messages;
        assert_eq!(history.len(), 1);
        let last = history.last().unwrap();
        assert_eq!(last.id, seen_by_ben.message_id);
        assert_eq!(last.timestamp(), seen_by_ben.timestamp);
    }

    #[tokio::test]
    async fn blank_or_malformed_frames_are_dropped() {
        let fx = fixture().await;
        let mut conn = fx.connection(Some(fx.ana));
        conn.open(8).await.unwrap();
        let mut events = conn.take_events().unwrap();

        for raw in [r#"{"message":""}"#, r#"{"message":"   "}"#, r#"{"body":"hi"}"#, "{", "[]"] {
            assert_eq!(conn.receive(raw).await, None);
        }

        assert_eq!(conn.state(), ConnectionState::Joined);
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(fx.stored().await, 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_leaves_the_room() {
        let fx = fixture().await;
        let mut conn = fx.connection(Some(fx.ana));
        conn.open(8).await.unwrap();
        let mut events = conn.take_events().unwrap();

        assert!(conn.close(CloseReason::ClientClosed));
        assert!(!conn.close(CloseReason::TransportError));
        assert_eq!(fx.broker.members(fx.room), 0);
        assert!(events.recv().await.is_none());

        assert_eq!(conn.receive(r#"{"message":"late"}"#).await, None);
        assert_eq!(fx.stored().await, 0);
    }

    #[tokio::test]
    async fn dropping_a_joined_connection_leaves_the_room() {
        let fx = fixture().await;
        let mut conn = fx.connection(Some(fx.ben));
        conn.open(8).await.unwrap();
        assert_eq!(fx.broker.members(fx.room), 1);

        drop(conn);
        assert_eq!(fx.broker.members(fx.room), 0);
    }

    #[tokio::test]
    async fn store_failure_is_reported_to_sender_only() {
        let fx = fixture().await;
        let mut ana = fx.connection(Some(fx.ana));
        let mut ben = fx.connection(Some(fx.ben));
        ana.open(8).await.unwrap();
        ben.open(8).await.unwrap();
        let mut ben_events = ben.take_events().unwrap();

        fx.db_pool.close().await;

        let reply = ana.receive(r#"{"message":"lost"}"#).await.unwrap();
        assert_eq!(reply.message_id, None);
        assert_eq!(ana.state(), ConnectionState::Joined);
        assert_eq!(ben_events.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    struct DownBroker(LocalBroker);

    #[async_trait]
    impl Broker for DownBroker {
        fn join(&self, room_id: Uuid, member_id: MemberId, sender: EventSender) {
            self.0.join(room_id, member_id, sender)
        }

        fn leave(&self, room_id: Uuid, member_id: MemberId) {
            self.0.leave(room_id, member_id)
        }

        async fn publish(&self, _room_id: Uuid, _event: Arc<ChatEvent>) -> Result<usize, BrokerError> {
            Err(BrokerError::Unavailable(sqlx::Error::PoolClosed))
        }

        fn members(&self, room_id: Uuid) -> usize {
            self.0.members(room_id)
        }
    }

    #[tokio::test]
    async fn publish_failure_keeps_message_and_reports_degraded() {
        let fx = fixture_with(Arc::new(DownBroker(LocalBroker::new()))).await;
        let mut conn = fx.connection(Some(fx.ana));
        conn.open(8).await.unwrap();

        let reply = conn.receive(r#"{"message":"are you there?"}"#).await.unwrap();
        let history = list_messages(&fx.db_pool, fx.room, 1, 50).await.unwrap().messages;
        assert_eq!(history.len(), 1);
        assert_eq!(reply.message_id, Some(history[0].id));
        assert_eq!(conn.state(), ConnectionState::Joined);
    }
}
