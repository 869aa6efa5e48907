//! User directory as seen from the chat core.
//!
//! Accounts are created and edited elsewhere (sign-up, bulk import, the admin
//! console); chat only reads them to resolve senders, check that invitees
//! exist and find people to talk to. [`register`] is the single write hook
//! those outer surfaces call.

mod search;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

pub(crate) use search::search_users;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Student,
    Alumni,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub enrollment_number: String,
    pub role: Role,
}

impl Profile {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_owned()
        }
    }

    pub fn initials(&self) -> String {
        let initials: String = [&self.first_name, &self.last_name]
            .iter()
            .filter_map(|name| name.trim().chars().next())
            .flat_map(char::to_uppercase)
            .collect();

        if initials.is_empty() {
            self.username
                .trim()
                .chars()
                .next()
                .map(|c| c.to_uppercase().collect())
                .unwrap_or_else(|| "?".to_owned())
        } else {
            initials
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub enrollment_number: String,
    pub role: Role,
}

pub async fn register(db_pool: &SqlitePool, new: NewProfile) -> Result<Profile, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id,username,first_name,last_name,enrollment_number,role) VALUES (?,?,?,?,?,?)")
        .bind(id)
        .bind(&new.username)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.enrollment_number)
        .bind(new.role)
        .execute(db_pool)
        .await?;

    tracing::debug!(user_id = %id, role = ?new.role, "registered user");

    Ok(Profile {
        id,
        username: new.username,
        first_name: new.first_name,
        last_name: new.last_name,
        enrollment_number: new.enrollment_number,
        role: new.role,
    })
}

pub async fn find(db_pool: &SqlitePool, user_id: Uuid) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as("SELECT id,username,first_name,last_name,enrollment_number,role FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(db_pool)
        .await
}

pub async fn exists(db_pool: &SqlitePool, user_id: Uuid) -> Result<bool, sqlx::Error> {
    Ok(sqlx::query("SELECT 1 FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}
