use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::{rooms::ChatEvent, store};

use super::{Broker, BrokerError, EventSender, MemberId};

struct Member {
    sender: EventSender,
    /// Microseconds since the epoch, same clock as relayed event stamps.
    joined_at: i64,
}

type Rooms = HashMap<Uuid, HashMap<MemberId, Member>>;

/// In-process membership registry.
///
/// Publishing never waits on a member: a member whose queue is full is
/// evicted as a slow consumer, which closes its queue and lets its
/// connection shut down.
#[derive(Default)]
pub struct LocalBroker {
    rooms: Mutex<Rooms>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `event` for every current member of `room_id`.
    pub fn deliver(&self, room_id: Uuid, event: &Arc<ChatEvent>) -> usize {
        self.fan_out(room_id, event, None)
    }

    /// Queues an event published at `published_at` elsewhere, skipping
    /// members that joined after that instant.
    pub fn deliver_published_at(&self, room_id: Uuid, event: &Arc<ChatEvent>, published_at: i64) -> usize {
        self.fan_out(room_id, event, Some(published_at))
    }

    fn fan_out(&self, room_id: Uuid, event: &Arc<ChatEvent>, published_at: Option<i64>) -> usize {
        let mut rooms = self.rooms();
        let Some(members) = rooms.get_mut(&room_id) else {
            return 0;
        };

        let mut delivered = 0;
        members.retain(|member_id, member| {
            if published_at.is_some_and(|at| member.joined_at > at) {
                return true;
            }
            match member.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(%room_id, member = %member_id, "evicting slow consumer");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        if members.is_empty() {
            rooms.remove(&room_id);
        }
        delivered
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn join(&self, room_id: Uuid, member_id: MemberId, sender: EventSender) {
        let member = Member {
            sender,
            joined_at: store::now_micros(),
        };
        self.rooms().entry(room_id).or_default().insert(member_id, member);
    }

    fn leave(&self, room_id: Uuid, member_id: MemberId) {
        let mut rooms = self.rooms();
        if let Some(members) = rooms.get_mut(&room_id) {
            members.remove(&member_id);
            if members.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    async fn publish(&self, room_id: Uuid, event: Arc<ChatEvent>) -> Result<usize, BrokerError> {
        Ok(self.deliver(room_id, &event))
    }

    fn members(&self, room_id: Uuid) -> usize {
        self.rooms().get(&room_id).map_or(0, HashMap::len)
    }
}
