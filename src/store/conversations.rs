use std::collections::HashSet;

use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::profiles::{self, Profile, Role};

use super::{clock, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub name: Option<String>,
    pub is_group: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub created_by: Option<Uuid>,
}

type ConversationRow = (Uuid, Option<String>, bool, i64, Option<Uuid>);

fn from_row((id, name, is_group, created_at, created_by): ConversationRow) -> Conversation {
    Conversation {
        id,
        name,
        is_group,
        created_at: clock::from_micros(created_at),
        created_by,
    }
}

#[derive(Debug, Clone)]
pub enum NewConversation {
    /// 1:1 chat with another user; reused if the pair already has one.
    Direct { with: Uuid },
    /// Group chat. Member ids that don't resolve to a user are skipped.
    Group { name: Option<String>, members: Vec<Uuid> },
}

#[derive(Debug, Clone)]
pub struct Created {
    pub conversation: Conversation,
    pub existing: bool,
}

/// Same key for (a, b) and (b, a).
fn direct_key(a: Uuid, b: Uuid) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}:{high}")
}

pub async fn create_conversation(
    db_pool: &SqlitePool,
    creator: Uuid,
    new: NewConversation,
) -> StoreResult<Created> {
    match new {
        NewConversation::Direct { with } => create_direct(db_pool, creator, with).await,
        NewConversation::Group { name, members } => create_group(db_pool, creator, name, members).await,
    }
}

async fn create_direct(db_pool: &SqlitePool, creator: Uuid, with: Uuid) -> StoreResult<Created> {
    if creator == with {
        return Err(StoreError::Validation("cannot start a conversation with yourself".to_owned()));
    }
    if !profiles::exists(db_pool, with).await? {
        return Err(StoreError::NotFound("user"));
    }

    let key = direct_key(creator, with);
    let now = clock::now_micros();
    let id = Uuid::new_v4();

    // The insert takes the write lock, so a concurrent creator of the same pair
    // waits here and then lands on the conflict branch.
    let mut tx = db_pool.begin().await?;
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        "INSERT INTO conversations (id,name,is_group,direct_key,created_at,created_by)
        VALUES (?,NULL,0,?,?,?)
        ON CONFLICT (direct_key) DO NOTHING
        RETURNING id",
    )
    .bind(id)
    .bind(&key)
    .bind(now)
    .bind(creator)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        let row: ConversationRow = sqlx::query_as(
            "SELECT id,name,is_group,created_at,created_by FROM conversations WHERE direct_key=?",
        )
        .bind(&key)
        .fetch_one(db_pool)
        .await?;

        return Ok(Created { conversation: from_row(row), existing: true });
    }

    for user_id in [creator, with] {
        sqlx::query("INSERT OR IGNORE INTO participants (conversation_id,user_id,joined_at) VALUES (?,?,?)")
            .bind(id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    tracing::debug!(conversation_id = %id, %creator, %with, "created direct conversation");

    Ok(Created {
        conversation: Conversation {
            id,
            name: None,
            is_group: false,
            created_at: clock::from_micros(now),
            created_by: Some(creator),
        },
        existing: false,
    })
}

async fn create_group(
    db_pool: &SqlitePool,
    creator: Uuid,
    name: Option<String>,
    members: Vec<Uuid>,
) -> StoreResult<Created> {
    let name = name.map(|n| n.trim().to_owned()).filter(|n| !n.is_empty());
    let now = clock::now_micros();
    let id = Uuid::new_v4();

    let mut tx = db_pool.begin().await?;
    sqlx::query("INSERT INTO conversations (id,name,is_group,direct_key,created_at,created_by) VALUES (?,?,1,NULL,?,?)")
        .bind(id)
        .bind(&name)
        .bind(now)
        .bind(creator)
        .execute(&mut *tx)
        .await?;

    sqlx::query("INSERT INTO participants (conversation_id,user_id,joined_at) VALUES (?,?,?)")
        .bind(id)
        .bind(creator)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    let mut seen = HashSet::from([creator]);
    let mut added = 0;
    for user_id in members {
        if !seen.insert(user_id) {
            continue;
        }
        // Selecting from users makes unknown ids insert nothing.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO participants (conversation_id,user_id,joined_at)
            SELECT ?, id, ? FROM users WHERE id = ?",
        )
        .bind(id)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        added += result.rows_affected();
    }
    tx.commit().await?;

    tracing::debug!(conversation_id = %id, %creator, members = added, "created group conversation");

    Ok(Created {
        conversation: Conversation {
            id,
            name,
            is_group: true,
            created_at: clock::from_micros(now),
            created_by: Some(creator),
        },
        existing: false,
    })
}

pub async fn get_conversation(db_pool: &SqlitePool, conversation_id: Uuid) -> StoreResult<Option<Conversation>> {
    let row: Option<ConversationRow> =
        sqlx::query_as("SELECT id,name,is_group,created_at,created_by FROM conversations WHERE id=?")
            .bind(conversation_id)
            .fetch_optional(db_pool)
            .await?;

    Ok(row.map(from_row))
}

pub async fn is_participant(db_pool: &SqlitePool, conversation_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
    Ok(sqlx::query("SELECT 1 FROM participants WHERE conversation_id=? AND user_id=?")
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .is_some())
}

/// Participant ids in the order they joined.
pub async fn participants(db_pool: &SqlitePool, conversation_id: Uuid) -> StoreResult<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT user_id FROM participants WHERE conversation_id=? ORDER BY joined_at, rowid")
            .bind(conversation_id)
            .fetch_all(db_pool)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub is_group: bool,
    /// Group name, or the other participant's name for a 1:1.
    pub display_name: String,
    pub initials: String,
    pub other_user_id: Option<Uuid>,
    pub last_message: Option<LastMessage>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    name: Option<String>,
    is_group: bool,
    message_id: Option<Uuid>,
    message_sender_id: Option<Uuid>,
    message_content: Option<String>,
    message_created_at: Option<i64>,
    other_id: Option<Uuid>,
    other_username: Option<String>,
    other_first_name: Option<String>,
    other_last_name: Option<String>,
    other_enrollment_number: Option<String>,
    other_role: Option<Role>,
}

impl SummaryRow {
    fn last_message(&self) -> Option<LastMessage> {
        let created_at = clock::from_micros(self.message_created_at?);
        Some(LastMessage {
            id: self.message_id?,
            sender_id: self.message_sender_id?,
            content: self.message_content.clone()?,
            created_at,
            timestamp: clock::format_hhmm(created_at),
        })
    }

    fn other(self) -> Option<Profile> {
        Some(Profile {
            id: self.other_id?,
            username: self.other_username?,
            first_name: self.other_first_name?,
            last_name: self.other_last_name?,
            enrollment_number: self.other_enrollment_number?,
            role: self.other_role?,
        })
    }
}

/// Conversations the user belongs to, most recently active first.
/// Conversations without messages rank by their creation time.
pub async fn list_conversations(db_pool: &SqlitePool, user_id: Uuid) -> StoreResult<Vec<ConversationSummary>> {
    let rows: Vec<SummaryRow> = sqlx::query_as(
        "SELECT c.id, c.name, c.is_group,
            m.id AS message_id, m.sender_id AS message_sender_id,
            m.content AS message_content, m.created_at AS message_created_at,
            u.id AS other_id, u.username AS other_username,
            u.first_name AS other_first_name, u.last_name AS other_last_name,
            u.enrollment_number AS other_enrollment_number, u.role AS other_role
        FROM participants p
        JOIN conversations c ON c.id = p.conversation_id
        LEFT JOIN messages m ON m.id = (
            SELECT id FROM messages WHERE conversation_id = c.id ORDER BY created_at DESC LIMIT 1
        )
        LEFT JOIN users u ON c.is_group = 0 AND u.id = (
            SELECT user_id FROM participants WHERE conversation_id = c.id AND user_id != p.user_id LIMIT 1
        )
        WHERE p.user_id = ?
        ORDER BY COALESCE(m.created_at, c.created_at) DESC",
    )
    .bind(user_id)
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let id = row.id;
            let is_group = row.is_group;
            let last_message = row.last_message();

            let (display_name, initials, other_user_id) = if is_group {
                let name = row.name.clone().unwrap_or_else(|| "Group chat".to_owned());
                let initials = group_initials(&name);
                (name, initials, None)
            } else {
                match row.other() {
                    Some(other) => (other.display_name(), other.initials(), Some(other.id)),
                    None => ("Unknown user".to_owned(), "?".to_owned(), None),
                }
            };

            ConversationSummary {
                id,
                is_group,
                display_name,
                initials,
                other_user_id,
                last_message,
            }
        })
        .collect())
}

fn group_initials(name: &str) -> String {
    let initials: String = name
        .split_whitespace()
        .take(2)
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect();

    if initials.is_empty() { "#".to_owned() } else { initials }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        profiles::{register, NewProfile, Role},
        store::create_message,
    };

    async fn user(db_pool: &SqlitePool, username: &str, first: &str, last: &str) -> Uuid {
        register(db_pool, NewProfile {
            username: username.to_owned(),
            first_name: first.to_owned(),
            last_name: last.to_owned(),
            enrollment_number: format!("EN-{username}"),
            role: Role::Alumni,
        })
        .await
        .unwrap()
        .id
    }

    #[test]
    fn direct_key_is_symmetric() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(a, b), direct_key(b, a));
        assert_ne!(direct_key(a, b), direct_key(a, Uuid::new_v4()));
    }

    #[tokio::test]
    async fn direct_conversation_is_reused_for_the_pair() {
        let db_pool = crate::db::memory().await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "Lima").await;
        let ben = user(&db_pool, "ben", "Ben", "Okafor").await;

        let first = create_conversation(&db_pool, ana, NewConversation::Direct { with: ben }).await.unwrap();
        let second = create_conversation(&db_pool, ben, NewConversation::Direct { with: ana }).await.unwrap();

        assert!(!first.existing);
        assert!(second.existing);
        assert_eq!(first.conversation.id, second.conversation.id);
        assert_eq!(participants(&db_pool, first.conversation.id).await.unwrap(), vec![ana, ben]);

        let stored = get_conversation(&db_pool, first.conversation.id).await.unwrap();
        assert_eq!(stored, Some(first.conversation));
        assert_eq!(get_conversation(&db_pool, Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_direct_creation_settles_on_one_conversation() {
        let dir = std::env::temp_dir().join(format!("reconnect-{}.db", Uuid::new_v4()));
        let url = format!("sqlite://{}?mode=rwc", dir.display());
        let db_pool = crate::db::connect(&url, 4).await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "").await;
        let ben = user(&db_pool, "ben", "Ben", "").await;

        let db_pool = Arc::new(db_pool);
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let db_pool = db_pool.clone();
                let (me, them) = if i % 2 == 0 { (ana, ben) } else { (ben, ana) };
                tokio::spawn(async move {
                    create_conversation(&db_pool, me, NewConversation::Direct { with: them }).await.unwrap()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        let mut fresh = 0;
        for task in tasks {
            let created = task.await.unwrap();
            ids.insert(created.conversation.id);
            if !created.existing {
                fresh += 1;
            }
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(fresh, 1);
        db_pool.close().await;
        let _ = std::fs::remove_file(dir);
    }

    #[tokio::test]
    async fn direct_conversation_validation() {
        let db_pool = crate::db::memory().await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "").await;

        assert!(matches!(
            create_conversation(&db_pool, ana, NewConversation::Direct { with: ana }).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            create_conversation(&db_pool, ana, NewConversation::Direct { with: Uuid::new_v4() }).await,
            Err(StoreError::NotFound("user"))
        ));
    }

    #[tokio::test]
    async fn group_skips_unknown_and_duplicate_members() {
        let db_pool = crate::db::memory().await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "").await;
        let ben = user(&db_pool, "ben", "Ben", "").await;
        let cy = user(&db_pool, "cy", "Cy", "").await;

        let created = create_conversation(&db_pool, ana, NewConversation::Group {
            name: Some("  Class of 2019 ".to_owned()),
            members: vec![ben, Uuid::new_v4(), cy, ben, ana],
        })
        .await
        .unwrap();

        assert!(!created.existing);
        assert!(created.conversation.is_group);
        assert_eq!(created.conversation.name.as_deref(), Some("Class of 2019"));

        let members = participants(&db_pool, created.conversation.id).await.unwrap();
        assert_eq!(members, vec![ana, ben, cy]);
        for member in members {
            assert!(is_participant(&db_pool, created.conversation.id, member).await.unwrap());
        }
    }

    #[tokio::test]
    async fn list_orders_by_latest_activity_and_names_the_other_side() {
        let db_pool = crate::db::memory().await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "Lima").await;
        let ben = user(&db_pool, "ben", "Ben", "Okafor").await;
        let cy = user(&db_pool, "cy", "Cy", "").await;

        let direct = create_conversation(&db_pool, ana, NewConversation::Direct { with: ben })
            .await
            .unwrap()
            .conversation;
        let group = create_conversation(&db_pool, cy, NewConversation::Group {
            name: Some("robotics club".to_owned()),
            members: vec![ana],
        })
        .await
        .unwrap()
        .conversation;
        let quiet = create_conversation(&db_pool, ana, NewConversation::Direct { with: cy })
            .await
            .unwrap()
            .conversation;

        create_message(&db_pool, group.id, cy, "first").await.unwrap();
        let latest = create_message(&db_pool, direct.id, ben, "latest").await.unwrap();

        let list = list_conversations(&db_pool, ana).await.unwrap();
        let ids: Vec<Uuid> = list.iter().map(|c| c.id).collect();
        assert_eq!(ids[0], direct.id);
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&group.id) && ids.contains(&quiet.id));

        let top = &list[0];
        assert_eq!(top.display_name, "Ben Okafor");
        assert_eq!(top.initials, "BO");
        assert_eq!(top.other_user_id, Some(ben));
        assert_eq!(top.last_message.as_ref().map(|m| m.id), Some(latest.id));

        let club = list.iter().find(|c| c.id == group.id).unwrap();
        assert_eq!(club.display_name, "robotics club");
        assert_eq!(club.initials, "RC");

        let silent = list.iter().find(|c| c.id == quiet.id).unwrap();
        assert!(silent.last_message.is_none());
        assert_eq!(silent.display_name, "Cy");
        assert_eq!(silent.other_user_id, Some(cy));
    }

    #[tokio::test]
    async fn direct_conversation_without_the_other_user_shows_unknown() {
        let db_pool = crate::db::memory().await.unwrap();
        let ana = user(&db_pool, "ana", "Ana", "").await;
        let ben = user(&db_pool, "ben", "Ben", "").await;
        let direct = create_conversation(&db_pool, ana, NewConversation::Direct { with: ben })
            .await
            .unwrap()
            .conversation;
        create_message(&db_pool, direct.id, ana, "still here").await.unwrap();

        sqlx::query("DELETE FROM users WHERE id=?").bind(ben).execute(&db_pool).await.unwrap();

        let list = list_conversations(&db_pool, ana).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].display_name, "Unknown user");
        assert_eq!(list[0].initials, "?");
        assert_eq!(list[0].other_user_id, None);
        assert_eq!(list[0].last_message.as_ref().map(|m| m.content.as_str()), Some("still here"));
    }
}
