use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::{rooms::ChatEvent, store, ShutdownSignal};

use super::{Broker, BrokerError, EventSender, LocalBroker, MemberId};

const BATCH: i64 = 500;

/// Broker shared by several server processes over one database.
///
/// Membership stays in the local registry of the process holding the
/// connection. Published events are appended to `broker_events` and
/// delivered locally right away; every process tails the table and hands
/// events from other nodes to its own members in `seq` order. A relayed
/// event only reaches members that had joined before it was published.
pub struct RelayBroker {
    local: LocalBroker,
    db_pool: SqlitePool,
    node_id: Uuid,
    cursor: AtomicI64,
}

impl RelayBroker {
    /// Starts reading after the newest event already in the table.
    pub async fn new(db_pool: SqlitePool) -> Result<Self, BrokerError> {
        let (cursor,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM broker_events")
            .fetch_one(&db_pool)
            .await?;

        Ok(Self {
            local: LocalBroker::new(),
            db_pool,
            node_id: Uuid::new_v4(),
            cursor: AtomicI64::new(cursor),
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Spawns the task that tails the outbox until shutdown.
    pub fn spawn_pump(self: &Arc<Self>, poll_interval: Duration, retention: Duration, mut shutdown: ShutdownSignal) {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_prune = Instant::now();

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.wait() => break,
                }

                if let Err(err) = broker.poll().await {
                    tracing::warn!(node = %broker.node_id, error = %err, "relay poll failed");
                }

                if last_prune.elapsed() >= retention {
                    match broker.prune(retention).await {
                        Ok(removed) => tracing::debug!(removed, "pruned relayed events"),
                        Err(err) => tracing::warn!(error = %err, "relay prune failed"),
                    }
                    last_prune = Instant::now();
                }
            }

            tracing::debug!(node = %broker.node_id, "relay pump stopped");
        });
    }

    /// Forwards events other nodes published since the last poll.
    /// Returns how many events were read.
    pub async fn poll(&self) -> Result<usize, BrokerError> {
        let cursor = self.cursor.load(Ordering::Acquire);
        let rows: Vec<(i64, Uuid, String, i64)> = sqlx::query_as(
            "SELECT seq,room_id,payload,created_at FROM broker_events
            WHERE seq > ? AND node_id != ?
            ORDER BY seq
            LIMIT ?",
        )
        .bind(cursor)
        .bind(self.node_id)
        .bind(BATCH)
        .fetch_all(&self.db_pool)
        .await?;

        let read = rows.len();
        let mut last = cursor;
        for (seq, room_id, payload, published_at) in rows {
            last = seq;
            match serde_json::from_str::<ChatEvent>(&payload) {
                Ok(event) => {
                    self.local.deliver_published_at(room_id, &Arc::new(event), published_at);
                }
                Err(err) => tracing::warn!(seq, error = %err, "skipping undecodable relayed event"),
            }
        }
        self.cursor.store(last, Ordering::Release);

        Ok(read)
    }

    async fn prune(&self, retention: Duration) -> Result<u64, BrokerError> {
        let cutoff = store::now_micros() - retention.as_micros() as i64;
        let result = sqlx::query("DELETE FROM broker_events WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Broker for RelayBroker {
    fn join(&self, room_id: Uuid, member_id: MemberId, sender: EventSender) {
        self.local.join(room_id, member_id, sender);
    }

    fn leave(&self, room_id: Uuid, member_id: MemberId) {
        self.local.leave(room_id, member_id);
    }

    async fn publish(&self, room_id: Uuid, event: Arc<ChatEvent>) -> Result<usize, BrokerError> {
        let payload = serde_json::to_string(&*event)?;
        sqlx::query("INSERT INTO broker_events (node_id,room_id,payload,created_at) VALUES (?,?,?,?)")
            .bind(self.node_id)
            .bind(room_id)
            .bind(payload)
            .bind(store::now_micros())
            .execute(&self.db_pool)
            .await?;

        Ok(self.local.deliver(room_id, &event))
    }

    fn members(&self, room_id: Uuid) -> usize {
        self.local.members(room_id)
    }
}
