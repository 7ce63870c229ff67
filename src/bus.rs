//! Table-backed event bus: an append-only monotonic log chaining sync,
//! compute, and resolution.
//!
//! `publish` runs inside the caller's transaction, so a consumer that has
//! observed sequence S has also observed every domain row committed with it.
//! Delivery is at-least-once; consumers stay idempotent via their own natural
//! keys.

use crate::error::Result;
use crate::now_ts;
use crate::store::Store;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// Bus event types.
pub const SYNC_COMPLETED: &str = "sync.completed";
pub const ANALYSIS_COMPLETED: &str = "analysis.completed";
pub const IDENTITY_MERGED: &str = "identity.merged";
pub const CONVERSATIONS_CHUNKED: &str = "conversations.chunked";

/// One bus log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub adapter: Option<String>,
    pub comms_event: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Append an event inside the caller's transaction. Returns the sequence.
pub async fn publish(
    conn: &mut SqliteConnection,
    event_type: &str,
    adapter: Option<&str>,
    comms_event_id: Option<&str>,
    payload: serde_json::Value,
) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO bus_events (event_type, adapter, comms_event_id, payload, created_at)
         VALUES (?, ?, ?, ?, ?)
         RETURNING seq",
    )
    .bind(event_type)
    .bind(adapter)
    .bind(comms_event_id)
    .bind(payload.to_string())
    .bind(now_ts())
    .fetch_one(&mut *conn)
    .await
    .context("failed to publish bus event")?;

    row.try_get("seq").context("failed to read bus sequence").map_err(Into::into)
}

fn bus_event_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BusEvent> {
    let payload: String = row.try_get("payload").unwrap_or_else(|_| "{}".to_string());
    Ok(BusEvent {
        seq: row.try_get("seq").context("failed to read seq")?,
        event_type: row
            .try_get("event_type")
            .context("failed to read event_type")?,
        adapter: row.try_get("adapter").ok(),
        comms_event: row.try_get("comms_event_id").ok(),
        payload: serde_json::from_str(&payload)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
    })
}

impl Store {
    /// Publish outside any larger transaction.
    pub async fn publish_bus_event(
        &self,
        event_type: &str,
        adapter: Option<&str>,
        comms_event_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let mut tx = self.begin().await?;
        let seq = publish(&mut tx, event_type, adapter, comms_event_id, payload).await?;
        tx.commit().await.context("failed to commit bus publish")?;
        Ok(seq)
    }

    /// Tail the log: events with seq > `since_seq`, oldest first.
    pub async fn list_bus_events(&self, since_seq: i64, limit: i64) -> Result<Vec<BusEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM bus_events WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(since_seq)
        .bind(limit.clamp(1, 10_000))
        .fetch_all(self.pool())
        .await
        .context("failed to list bus events")?;
        rows.into_iter().map(bus_event_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_is_strictly_monotonic() {
        let store = Store::in_memory().await.expect("store should open");

        let a = store
            .publish_bus_event(SYNC_COMPLETED, Some("eve"), None, serde_json::json!({"ok": true}))
            .await
            .expect("publish");
        let b = store
            .publish_bus_event(ANALYSIS_COMPLETED, None, None, serde_json::json!({}))
            .await
            .expect("publish");
        assert!(b > a);

        let tail = store.list_bus_events(a, 10).await.expect("list");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, b);
        assert_eq!(tail[0].event_type, ANALYSIS_COMPLETED);
    }
}
