use axum::{
    debug_handler,
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    session::CurrentUser,
    store::{self, Conversation, NewConversation},
    AppError, AppResult,
};

/// Either `{user_id}` for a 1:1 or `{is_group: true, name, user_ids}`.
#[derive(Debug, Deserialize)]
pub(crate) struct NewConversationBody {
    user_id: Option<String>,
    #[serde(default)]
    is_group: bool,
    name: Option<String>,
    #[serde(default)]
    user_ids: Vec<String>,
}

impl NewConversationBody {
    fn into_request(self) -> AppResult<NewConversation> {
        if self.is_group {
            // Ids that don't parse are skipped like ids of unknown users.
            let members = self
                .user_ids
                .iter()
                .filter_map(|id| Uuid::parse_str(id.trim()).ok())
                .collect();
            return Ok(NewConversation::Group { name: self.name, members });
        }

        let user_id = self
            .user_id
            .ok_or_else(|| AppError::Validation("user_id is required".to_owned()))?;
        let with = Uuid::parse_str(user_id.trim())
            .map_err(|_| AppError::Validation(format!("user_id {user_id:?} is not a valid id")))?;
        Ok(NewConversation::Direct { with })
    }
}

#[derive(Serialize)]
pub(crate) struct CreatedConversation {
    conversation: Conversation,
    participants: Vec<Uuid>,
    existing: bool,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn new_conversation(
    State(db_pool): State<SqlitePool>,
    CurrentUser(user_id): CurrentUser,
    body: Result<Json<NewConversationBody>, JsonRejection>,
) -> AppResult<(StatusCode, Json<CreatedConversation>)> {
    let Json(body) = body.map_err(|e| AppError::Validation(e.body_text()))?;
    let request = body.into_request()?;

    let created = store::create_conversation(&db_pool, user_id, request).await?;
    let participants = store::participants(&db_pool, created.conversation.id).await?;

    let status = if created.existing { StatusCode::OK } else { StatusCode::CREATED };
    Ok((
        status,
        Json(CreatedConversation {
            conversation: created.conversation,
            participants,
            existing: created.existing,
        }),
    ))
}
