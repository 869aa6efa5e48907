use std::{collections::HashMap, sync::Arc};

use axum::{
    debug_handler,
    extract::{rejection::{JsonRejection, QueryRejection}, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    broker::Broker,
    profiles,
    session::CurrentUser,
    store::{self, ConversationSummary, Message},
    AppError, AppResult,
};

use super::msg::{self, Delivery};

pub const PAGE_SIZE: i64 = 50;

/// Forbidden for non-members and for conversations that don't exist alike.
pub(crate) async fn require_participant(db_pool: &SqlitePool, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
    if store::is_participant(db_pool, conversation_id, user_id).await? {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

#[derive(Serialize)]
pub(crate) struct ConversationList {
    conversations: Vec<ConversationSummary>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list_conversations(
    State(db_pool): State<SqlitePool>,
    CurrentUser(user_id): CurrentUser,
) -> AppResult<Json<ConversationList>> {
    let conversations = store::list_conversations(&db_pool, user_id).await?;
    Ok(Json(ConversationList { conversations }))
}

#[derive(Deserialize)]
pub(crate) struct PageQuery {
    page: Option<i64>,
}

#[derive(Serialize)]
pub(crate) struct HistoryMessage {
    id: Uuid,
    sender_id: Uuid,
    sender_name: String,
    sender_initials: String,
    content: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    timestamp: String,
    is_mine: bool,
}

#[derive(Serialize)]
pub(crate) struct HistoryPage {
    page: i64,
    has_more: bool,
    messages: Vec<HistoryMessage>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list_messages(
    State(db_pool): State<SqlitePool>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> AppResult<Json<HistoryPage>> {
    let Query(PageQuery { page }) = query.map_err(|e| AppError::Validation(e.body_text()))?;
    require_participant(&db_pool, conversation_id, user_id).await?;

    let page = store::list_messages(&db_pool, conversation_id, page.unwrap_or(1), PAGE_SIZE).await?;

    let mut names: HashMap<Uuid, (String, String)> = HashMap::new();
    let mut messages = Vec::with_capacity(page.messages.len());
    for message in page.messages {
        if !names.contains_key(&message.sender_id) {
            let name = match profiles::find(&db_pool, message.sender_id).await? {
                Some(profile) => (profile.display_name(), profile.initials()),
                None => ("Unknown user".to_owned(), "?".to_owned()),
            };
            names.insert(message.sender_id, name);
        }
        let (sender_name, sender_initials) = names[&message.sender_id].clone();

        messages.push(HistoryMessage {
            id: message.id,
            sender_id: message.sender_id,
            sender_name,
            sender_initials,
            timestamp: message.timestamp(),
            is_mine: message.sender_id == user_id,
            created_at: message.created_at,
            content: message.content,
        });
    }

    Ok(Json(HistoryPage {
        page: page.page,
        has_more: page.has_more,
        messages,
    }))
}

#[derive(Deserialize)]
pub(crate) struct SendMessageBody {
    content: String,
}

#[derive(Serialize)]
pub(crate) struct SentMessage {
    message: Message,
    timestamp: String,
    /// `false` when the message was saved but live delivery failed.
    delivered: bool,
}

/// Fallback for clients without a socket. Goes through the same save and
/// broadcast path as socket messages, so connected members see it live.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn send_message(
    State(db_pool): State<SqlitePool>,
    State(broker): State<Arc<dyn Broker>>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
    body: Result<Json<SendMessageBody>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SentMessage>)> {
    let Json(SendMessageBody { content }) = body.map_err(|e| AppError::Validation(e.body_text()))?;
    require_participant(&db_pool, conversation_id, user_id).await?;

    let posted = msg::send_msg(&db_pool, broker.as_ref(), conversation_id, user_id, &content).await?;
    let delivered = matches!(posted.delivery, Delivery::Delivered(_));

    Ok((
        StatusCode::CREATED,
        Json(SentMessage {
            timestamp: posted.message.timestamp(),
            message: posted.message,
            delivered,
        }),
    ))
}
