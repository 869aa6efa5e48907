use axum::{debug_handler, extract::{Query, State}, Json};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{session::CurrentUser, AppResult};

use super::{Profile, Role};

const MIN_QUERY_LEN: usize = 2;
const MAX_RESULTS: i64 = 20;

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Serialize)]
pub(crate) struct UserHit {
    id: Uuid,
    name: String,
    initials: String,
    username: String,
    role: Role,
}

impl From<Profile> for UserHit {
    fn from(profile: Profile) -> Self {
        Self {
            id: profile.id,
            name: profile.display_name(),
            initials: profile.initials(),
            role: profile.role,
            username: profile.username,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct SearchResponse {
    users: Vec<UserHit>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn search_users(
    State(db_pool): State<SqlitePool>,
    CurrentUser(user_id): CurrentUser,
    Query(SearchQuery { q }): Query<SearchQuery>,
) -> AppResult<Json<SearchResponse>> {
    let q = q.trim();
    if q.chars().count() < MIN_QUERY_LEN {
        return Ok(Json(SearchResponse { users: Vec::new() }));
    }

    let users = search(&db_pool, q, user_id).await?;
    Ok(Json(SearchResponse {
        users: users.into_iter().map(UserHit::from).collect(),
    }))
}

/// Case-insensitive substring match on names, username and enrollment number.
pub async fn search(db_pool: &SqlitePool, q: &str, exclude: Uuid) -> Result<Vec<Profile>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id,username,first_name,last_name,enrollment_number,role FROM users
        WHERE id != ?1 AND (
            instr(lower(username), lower(?2)) > 0
            OR instr(lower(first_name), lower(?2)) > 0
            OR instr(lower(last_name), lower(?2)) > 0
            OR instr(lower(enrollment_number), lower(?2)) > 0
        )
        ORDER BY username
        LIMIT ?3",
    )
    .bind(exclude)
    .bind(q)
    .bind(MAX_RESULTS)
    .fetch_all(db_pool)
    .await
}
