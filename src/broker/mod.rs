//! Room membership and fan-out.
//!
//! A member is one open connection: it joins a room with the sending half of
//! its own bounded queue, and every event published to the room afterwards
//! is pushed onto that queue. Members that join later never see earlier
//! events. Successive publishes from one caller reach each member in order.

mod local;
mod relay;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::rooms::ChatEvent;

pub use local::LocalBroker;
pub use relay::RelayBroker;

pub type MemberId = Uuid;
pub type EventSender = mpsc::Sender<Arc<ChatEvent>>;
pub type EventReceiver = mpsc::Receiver<Arc<ChatEvent>>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("event relay unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("could not encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn join(&self, room_id: Uuid, member_id: MemberId, sender: EventSender);

    /// No-op when the member is not in the room.
    fn leave(&self, room_id: Uuid, member_id: MemberId);

    /// Returns how many local members the event was queued for.
    async fn publish(&self, room_id: Uuid, event: Arc<ChatEvent>) -> Result<usize, BrokerError>;

    /// Members of `room_id` connected to this process.
    fn members(&self, room_id: Uuid) -> usize;
}

/// A room membership that is released exactly once, at the latest on drop.
pub struct Membership {
    broker: Arc<dyn Broker>,
    room_id: Uuid,
    member_id: MemberId,
    left: AtomicBool,
}

impl Membership {
    pub fn join(broker: Arc<dyn Broker>, room_id: Uuid, capacity: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let member_id = Uuid::new_v4();
        broker.join(room_id, member_id, sender);

        let membership = Self {
            broker,
            room_id,
            member_id,
            left: AtomicBool::new(false),
        };
        (membership, receiver)
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Returns `false` if the membership had already been released.
    pub fn leave(&self) -> bool {
        if self.left.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.broker.leave(self.room_id, self.member_id);
        true
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.leave();
    }
}
