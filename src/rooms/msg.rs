use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    broker::{Broker, BrokerError},
    profiles,
    store::{self, Message, StoreResult},
};

/// A chat message as broadcast to everyone connected to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub message: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_initials: String,
    pub message_id: Uuid,
    pub timestamp: String,
}

/// Frames written to a client socket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    ChatMessage(&'a ChatEvent),
    Error {
        error: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
    },
}

/// Inbound envelope; anything besides `message` is ignored.
#[derive(Deserialize)]
struct Inbound {
    message: String,
}

/// Extracts trimmed, non-empty text from a client frame.
pub(crate) fn parse_inbound(raw: &str) -> Option<String> {
    let Inbound { message } = serde_json::from_str(raw).ok()?;
    let message = message.trim();
    (!message.is_empty()).then(|| message.to_owned())
}

#[derive(Debug)]
pub enum Delivery {
    /// Queued for this many members connected to this process.
    Delivered(usize),
    /// Saved, but live members may not have seen it.
    Degraded(BrokerError),
}

#[derive(Debug)]
pub struct Posted {
    pub message: Message,
    pub event: Arc<ChatEvent>,
    pub delivery: Delivery,
}

/// Persists a message and then publishes it to the room.
///
/// A publish failure does not undo the insert: the message stays in history
/// and the caller learns the live delivery was degraded.
pub(crate) async fn send_msg(
    db_pool: &SqlitePool,
    broker: &dyn Broker,
    room_id: Uuid,
    sender_id: Uuid,
    content: &str,
) -> StoreResult<Posted> {
    let message = store::create_message(db_pool, room_id, sender_id, content).await?;

    let (sender_name, sender_initials) = match profiles::find(db_pool, sender_id).await {
        Ok(Some(profile)) => (profile.display_name(), profile.initials()),
        Ok(None) => ("Unknown user".to_owned(), "?".to_owned()),
        Err(err) => {
            tracing::warn!(%sender_id, error = %err, "sender lookup failed, broadcasting without a name");
            ("Unknown user".to_owned(), "?".to_owned())
        }
    };

    let event = Arc::new(ChatEvent {
        message: message.content.clone(),
        sender_id,
        sender_name,
        sender_initials,
        message_id: message.id,
        timestamp: message.timestamp(),
    });

    let delivery = match broker.publish(room_id, event.clone()).await {
        Ok(members) => Delivery::Delivered(members),
        Err(err) => {
            tracing::warn!(%room_id, message_id = %message.id, error = %err, "message saved but not broadcast");
            Delivery::Degraded(err)
        }
    };

    Ok(Posted { message, event, delivery })
}
