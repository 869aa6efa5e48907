//! Conversation chat: the live socket gateway and the HTTP history surface.

mod connection;
mod history;
mod msg;
mod new;
mod ws;

use axum::{routing::get, Router};

use crate::{profiles, AppState};

pub use connection::{CloseReason, Connection, ConnectionState, OpenError, Reply};
pub use history::PAGE_SIZE;
pub use msg::{ChatEvent, Delivery, Posted, ServerFrame};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(history::list_conversations).post(new::new_conversation))
        .route("/conversations/{id}/messages", get(history::list_messages).post(history::send_message))
        .route("/conversations/{id}/ws", get(ws::room_ws))
        .route("/users/search", get(profiles::search_users))
}
