//! Events, participant edges, and threads. Events are strictly append-only.

use crate::error::Result;
use crate::store::Store;
use crate::{Channel, Direction, Role, new_id, now_ts};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// One immutable communication act.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub channel: Channel,
    pub adapter: String,
    pub external_id: String,
    pub timestamp: i64,
    pub content_types: Vec<String>,
    pub content: Option<String>,
    pub direction: Direction,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub payload_hash: Option<String>,
    pub created_at: i64,
}

/// Input for event insertion; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub channel: Channel,
    pub adapter: String,
    pub external_id: String,
    pub timestamp: i64,
    pub content_types: Vec<String>,
    pub content: Option<String>,
    pub direction: Direction,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub payload_hash: Option<String>,
}

/// Participant edge input: who played which role on an event.
#[derive(Debug, Clone)]
pub struct ParticipantRef {
    pub person_id: String,
    pub role: Role,
}

/// Outcome of an idempotent event insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    Existing,
}

/// Insert an event; a natural-key hit on (adapter, external id) leaves the
/// existing row untouched.
pub async fn insert_event(
    conn: &mut SqliteConnection,
    event: &NewEvent,
) -> Result<(String, InsertOutcome)> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM events WHERE adapter = ? AND external_id = ?")
            .bind(&event.adapter)
            .bind(&event.external_id)
            .fetch_optional(&mut *conn)
            .await
            .context("failed to check event natural key")?;

    if let Some(id) = existing {
        return Ok((id, InsertOutcome::Existing));
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO events
             (id, channel, adapter, external_id, timestamp, content_types, content,
              direction, thread_id, reply_to, payload_hash, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(event.channel.as_str())
    .bind(&event.adapter)
    .bind(&event.external_id)
    .bind(event.timestamp)
    .bind(serde_json::to_string(&event.content_types).context("failed to serialize content types")?)
    .bind(&event.content)
    .bind(event.direction.as_str())
    .bind(&event.thread_id)
    .bind(&event.reply_to)
    .bind(&event.payload_hash)
    .bind(now_ts())
    .execute(&mut *conn)
    .await
    .context("failed to insert event")?;

    Ok((id, InsertOutcome::Created))
}

/// Upsert a channel-native thread, returning its id.
pub async fn upsert_thread(
    conn: &mut SqliteConnection,
    channel: Channel,
    external_id: &str,
    title: Option<&str>,
) -> Result<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM threads WHERE channel = ? AND external_id = ?")
            .bind(channel.as_str())
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await
            .context("failed to look up thread")?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO threads (id, channel, external_id, title, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(channel.as_str())
    .bind(external_id)
    .bind(title)
    .bind(now_ts())
    .execute(&mut *conn)
    .await
    .context("failed to insert thread")?;
    Ok(id)
}

/// Add a participant edge; duplicate edges are ignored.
pub async fn add_participant(
    conn: &mut SqliteConnection,
    event_id: &str,
    person_id: &str,
    role: Role,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO participants (event_id, person_id, role) VALUES (?, ?, ?)",
    )
    .bind(event_id)
    .bind(person_id)
    .bind(role.as_str())
    .execute(&mut *conn)
    .await
    .context("failed to insert participant")?;
    Ok(())
}

pub(crate) fn event_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Event> {
    let channel: String = row.try_get("channel").context("failed to read channel")?;
    let direction: String = row.try_get("direction").context("failed to read direction")?;
    let content_types: String = row
        .try_get("content_types")
        .unwrap_or_else(|_| "[]".to_string());
    Ok(Event {
        id: row.try_get("id").context("failed to read event id")?,
        channel: Channel::parse(&channel)
            .with_context(|| format!("invalid channel in database: {channel}"))?,
        adapter: row.try_get("adapter").context("failed to read adapter")?,
        external_id: row
            .try_get("external_id")
            .context("failed to read external_id")?,
        timestamp: row.try_get("timestamp").context("failed to read timestamp")?,
        content_types: serde_json::from_str(&content_types).unwrap_or_default(),
        content: row.try_get("content").ok(),
        direction: Direction::parse(&direction)
            .with_context(|| format!("invalid direction in database: {direction}"))?,
        thread_id: row.try_get("thread_id").ok(),
        reply_to: row.try_get("reply_to").ok(),
        payload_hash: row.try_get("payload_hash").ok(),
        created_at: row.try_get("created_at").context("failed to read created_at")?,
    })
}

impl Store {
    pub async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch event")?;
        row.map(event_from_row).transpose()
    }

    pub async fn count_events(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(self.pool())
            .await
            .context("failed to count events")
            .map_err(Into::into)
    }

    /// Events on a channel in ascending time order, optionally time-bounded.
    pub async fn events_for_channel(
        &self,
        channel: Channel,
        since: Option<i64>,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE channel = ? AND timestamp >= ?
             ORDER BY timestamp, id",
        )
        .bind(channel.as_str())
        .bind(since.unwrap_or(0))
        .fetch_all(self.pool())
        .await
        .context("failed to list channel events")?;
        rows.into_iter().map(event_from_row).collect()
    }

    pub async fn participants_for_event(&self, event_id: &str) -> Result<Vec<(String, Role)>> {
        let rows = sqlx::query("SELECT person_id, role FROM participants WHERE event_id = ?")
            .bind(event_id)
            .fetch_all(self.pool())
            .await
            .context("failed to list participants")?;
        rows.into_iter()
            .map(|row| {
                let person: String = row
                    .try_get("person_id")
                    .context("failed to read person_id")?;
                let role: String = row.try_get("role").context("failed to read role")?;
                let role = Role::parse(&role)
                    .with_context(|| format!("invalid role in database: {role}"))?;
                Ok((person, role))
            })
            .collect()
    }

    /// Number of events two persons both participate in.
    pub async fn shared_event_count(&self, person_a: &str, person_b: &str) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(DISTINCT a.event_id) FROM participants a
             JOIN participants b ON a.event_id = b.event_id
             WHERE a.person_id = ? AND b.person_id = ?",
        )
        .bind(person_a)
        .bind(person_b)
        .fetch_one(self.pool())
        .await
        .context("failed to count shared events")
        .map_err(Into::into)
    }

    /// Number of events a person participates in.
    pub async fn event_count_for_person(&self, person_id: &str) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(DISTINCT event_id) FROM participants WHERE person_id = ?",
        )
        .bind(person_id)
        .fetch_one(self.pool())
        .await
        .context("failed to count person events")
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(external_id: &str) -> NewEvent {
        NewEvent {
            channel: Channel::Email,
            adapter: "gogcli".to_string(),
            external_id: external_id.to_string(),
            timestamp: 1_700_000_000,
            content_types: vec!["text/plain".to_string()],
            content: Some("hello".to_string()),
            direction: Direction::Received,
            thread_id: None,
            reply_to: None,
            payload_hash: Some(crate::fingerprint(b"hello")),
        }
    }

    #[tokio::test]
    async fn reingest_leaves_event_count_unchanged() {
        let store = Store::in_memory().await.expect("store should open");

        let mut tx = store.begin().await.expect("begin");
        let (id1, outcome1) = insert_event(&mut tx, &sample_event("msg-1"))
            .await
            .expect("insert");
        let (id2, outcome2) = insert_event(&mut tx, &sample_event("msg-1"))
            .await
            .expect("re-insert");
        tx.commit().await.expect("commit");

        assert_eq!(outcome1, InsertOutcome::Created);
        assert_eq!(outcome2, InsertOutcome::Existing);
        assert_eq!(id1, id2);
        assert_eq!(store.count_events().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn thread_upsert_returns_stable_id() {
        let store = Store::in_memory().await.expect("store should open");
        let mut tx = store.begin().await.expect("begin");
        let a = upsert_thread(&mut tx, Channel::Imessage, "chat-7", Some("family"))
            .await
            .expect("upsert");
        let b = upsert_thread(&mut tx, Channel::Imessage, "chat-7", None)
            .await
            .expect("upsert again");
        tx.commit().await.expect("commit");
        assert_eq!(a, b);
    }
}
