use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{clock, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// `HH:MM` of the commit time, as sent to live clients.
    pub fn timestamp(&self) -> String {
        clock::format_hhmm(self.created_at)
    }
}

type MessageRow = (Uuid, Uuid, Uuid, String, i64);

fn from_row((id, conversation_id, sender_id, content, created_at): MessageRow) -> Message {
    Message {
        id,
        conversation_id,
        sender_id,
        content,
        created_at: clock::from_micros(created_at),
    }
}

/// Persists a message and returns it with its commit timestamp.
///
/// The timestamp is `max(now, previous + 1µs)` within the conversation,
/// computed in the same statement as the insert, so history order and
/// insertion order agree even when the wall clock steps backwards.
pub async fn create_message(
    db_pool: &SqlitePool,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: &str,
) -> StoreResult<Message> {
    let content = content.trim();
    if content.is_empty() {
        return Err(StoreError::Validation("message content is empty".to_owned()));
    }

    let id = Uuid::new_v4();
    let created_at: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO messages (id,conversation_id,sender_id,content,created_at)
        SELECT ?1, ?2, ?3, ?4, MAX(?5, COALESCE((SELECT MAX(created_at) + 1 FROM messages WHERE conversation_id = ?2), ?5))
        WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?2)
        RETURNING created_at",
    )
    .bind(id)
    .bind(conversation_id)
    .bind(sender_id)
    .bind(content)
    .bind(clock::now_micros())
    .fetch_optional(db_pool)
    .await?;

    let Some((created_at,)) = created_at else {
        return Err(StoreError::NotFound("conversation"));
    };

    Ok(Message {
        id,
        conversation_id,
        sender_id,
        content: content.to_owned(),
        created_at: clock::from_micros(created_at),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub page: i64,
    pub has_more: bool,
    pub messages: Vec<Message>,
}

/// Page 1 holds the newest `page_size` messages. Each page comes back oldest
/// first so the client can append it as-is.
pub async fn list_messages(
    db_pool: &SqlitePool,
    conversation_id: Uuid,
    page: i64,
    page_size: i64,
) -> StoreResult<MessagePage> {
    if page < 1 {
        return Err(StoreError::Validation(format!("page must be 1 or greater, got {page}")));
    }
    if page_size < 1 {
        return Err(StoreError::Validation(format!("page size must be 1 or greater, got {page_size}")));
    }

    let offset = (page - 1).saturating_mul(page_size);
    let rows: Vec<MessageRow> = sqlx::query_as(
        "SELECT id,conversation_id,sender_id,content,created_at FROM messages
        WHERE conversation_id = ?
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?",
    )
    .bind(conversation_id)
    .bind(page_size + 1)
    .bind(offset)
    .fetch_all(db_pool)
    .await?;

    let has_more = rows.len() as i64 > page_size;
    let mut messages: Vec<Message> = rows
        .into_iter()
        .take(page_size as usize)
        .map(from_row)
        .collect();
    messages.reverse();

    Ok(MessagePage { page, has_more, messages })
}
