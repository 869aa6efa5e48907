use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{broker::Broker, session::MaybeUser, AppError, AppState, Config, ShutdownSignal};

use super::{
    connection::{CloseReason, Connection, OpenError, Reply},
    msg::ServerFrame,
};

/// Upgrades to the chat socket for one conversation.
///
/// Anonymous callers and non-participants get a bare 403 before the
/// upgrade, so nothing is ever sent to them.
#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<Uuid>,
    State(db_pool): State<SqlitePool>,
    State(broker): State<Arc<dyn Broker>>,
    State(config): State<Arc<Config>>,
    State(shutdown): State<ShutdownSignal>,
    MaybeUser(user_id): MaybeUser,
    ws: WebSocketUpgrade,
) -> Response {
    let mut conn = Connection::new(db_pool, broker, user_id, room_id);
    match conn.open(config.ws_queue_capacity).await {
        Ok(()) => {}
        Err(OpenError::Store(err)) => return AppError::from(err).into_response(),
        Err(OpenError::Anonymous | OpenError::NotParticipant) => {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let send_timeout = config.ws_send_timeout;
    // If the upgrade never completes the closure is dropped with `conn`,
    // which releases the membership.
    ws.on_upgrade(move |socket| serve(conn, socket, send_timeout, shutdown))
}

fn encode_reply(reply: &Reply) -> serde_json::Result<String> {
    serde_json::to_string(&ServerFrame::Error {
        error: reply.error,
        message_id: reply.message_id,
    })
}

async fn serve(mut conn: Connection, socket: WebSocket, send_timeout: Duration, mut shutdown: ShutdownSignal) {
    let Some(mut events) = conn.take_events() else {
        return;
    };
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(8);

    // Writer: room events and replies to this client, each bounded by the
    // send timeout. A closed event queue means the broker evicted us.
    let mut writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => serde_json::to_string(&ServerFrame::ChatMessage(&event)),
                    None => return CloseReason::SlowConsumer,
                },
                Some(reply) = reply_rx.recv() => encode_reply(&reply),
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping unencodable frame");
                    continue;
                }
            };

            match tokio::time::timeout(send_timeout, sink.send(WsMessage::Text(frame.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return CloseReason::TransportError,
                Err(_) => return CloseReason::SlowConsumer,
            }
        }
    });

    // Reader: frames are handled one at a time, in the order received.
    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    // Waits for the writer rather than dropping a reply. A stalled
                    // writer gives up after the send timeout and closes the queue.
                    if let Some(reply) = conn.receive(text.as_str()).await {
                        let _ = reply_tx.send(reply).await;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break CloseReason::ClientClosed,
                Some(Ok(_)) => {}
                Some(Err(_)) => break CloseReason::TransportError,
            },
            result = &mut writer => break result.unwrap_or(CloseReason::TransportError),
            _ = shutdown.wait() => break CloseReason::ServerShutdown,
        }
    };

    writer.abort();
    conn.close(reason);
}
