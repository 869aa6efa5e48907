//! Durable conversations, participants and messages.
//!
//! Everything here is plain data access over the SQLite pool; nothing knows
//! about sockets or the broker. Uniqueness (one participant row per
//! conversation and user, one 1:1 conversation per pair of users) is
//! enforced by the schema and resolved here by reusing the existing row.

mod clock;
mod conversations;
mod messages;

pub use clock::{format_hhmm, from_micros, now_micros};
pub use conversations::{
    create_conversation, get_conversation, is_participant, list_conversations, participants,
    Conversation, ConversationSummary, Created, LastMessage, NewConversation,
};
pub use messages::{create_message, list_messages, Message, MessagePage};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
