//! Chunk definitions and chunker-produced conversations.

use crate::error::Result;
use crate::store::Store;
use crate::{new_id, now_ts};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// A stored chunking definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDefinition {
    pub name: String,
    pub channel: Option<String>,
    pub strategy: String,
    pub config: serde_json::Value,
    pub description: Option<String>,
}

/// A chunker-produced window of events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub definition: String,
    pub channel: Option<String>,
    pub thread_id: Option<String>,
    pub first_event_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub event_count: i64,
}

fn conversation_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id").context("failed to read conversation id")?,
        definition: row.try_get("definition").context("failed to read definition")?,
        channel: row.try_get("channel").ok(),
        thread_id: row.try_get("thread_id").ok(),
        first_event_id: row
            .try_get("first_event_id")
            .context("failed to read first_event_id")?,
        started_at: row.try_get("started_at").context("failed to read started_at")?,
        ended_at: row.try_get("ended_at").context("failed to read ended_at")?,
        event_count: row.try_get("event_count").unwrap_or(0),
    })
}

/// Upsert a conversation keyed on (definition, first event id) and rewrite
/// its member list. Positions never duplicate because members are replaced
/// wholesale.
pub async fn upsert_conversation(
    conn: &mut SqliteConnection,
    definition: &str,
    channel: Option<&str>,
    thread_id: Option<&str>,
    member_event_ids: &[String],
    started_at: i64,
    ended_at: i64,
) -> Result<String> {
    let first_event_id = member_event_ids
        .first()
        .context("conversation must have at least one event")?;

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM conversations WHERE definition = ? AND first_event_id = ?",
    )
    .bind(definition)
    .bind(first_event_id)
    .fetch_optional(&mut *conn)
    .await
    .context("failed to look up conversation")?;

    let id = match existing {
        Some(id) => {
            sqlx::query(
                "UPDATE conversations SET channel = ?, thread_id = ?, started_at = ?, ended_at = ?, event_count = ?
                 WHERE id = ?",
            )
            .bind(channel)
            .bind(thread_id)
            .bind(started_at)
            .bind(ended_at)
            .bind(member_event_ids.len() as i64)
            .bind(&id)
            .execute(&mut *conn)
            .await
            .context("failed to update conversation")?;
            sqlx::query("DELETE FROM conversation_events WHERE conversation_id = ?")
                .bind(&id)
                .execute(&mut *conn)
                .await
                .context("failed to clear conversation members")?;
            id
        }
        None => {
            let id = new_id();
            sqlx::query(
                "INSERT INTO conversations
                     (id, definition, channel, thread_id, first_event_id, started_at, ended_at, event_count)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(definition)
            .bind(channel)
            .bind(thread_id)
            .bind(first_event_id)
            .bind(started_at)
            .bind(ended_at)
            .bind(member_event_ids.len() as i64)
            .execute(&mut *conn)
            .await
            .context("failed to insert conversation")?;
            id
        }
    };

    for (position, event_id) in member_event_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO conversation_events (conversation_id, event_id, position) VALUES (?, ?, ?)",
        )
        .bind(&id)
        .bind(event_id)
        .bind(position as i64)
        .execute(&mut *conn)
        .await
        .context("failed to insert conversation member")?;
    }

    Ok(id)
}

impl Store {
    pub async fn upsert_chunk_definition(&self, definition: &ChunkDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO chunk_definitions (name, channel, strategy, config, description)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 channel = excluded.channel, strategy = excluded.strategy,
                 config = excluded.config, description = excluded.description",
        )
        .bind(&definition.name)
        .bind(&definition.channel)
        .bind(&definition.strategy)
        .bind(definition.config.to_string())
        .bind(&definition.description)
        .execute(self.pool())
        .await
        .context("failed to upsert chunk definition")?;
        Ok(())
    }

    pub async fn get_chunk_definition(&self, name: &str) -> Result<Option<ChunkDefinition>> {
        let row = sqlx::query("SELECT * FROM chunk_definitions WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch chunk definition")?;
        row.map(|row| {
            let config: String = row.try_get("config").unwrap_or_else(|_| "{}".to_string());
            Ok(ChunkDefinition {
                name: row.try_get("name").context("failed to read name")?,
                channel: row.try_get("channel").ok(),
                strategy: row.try_get("strategy").context("failed to read strategy")?,
                config: serde_json::from_str(&config)
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
                description: row.try_get("description").ok(),
            })
        })
        .transpose()
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch conversation")?;
        row.map(conversation_from_row).transpose()
    }

    pub async fn conversations_for_definition(&self, definition: &str) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE definition = ? ORDER BY started_at, id",
        )
        .bind(definition)
        .fetch_all(self.pool())
        .await
        .context("failed to list conversations")?;
        rows.into_iter().map(conversation_from_row).collect()
    }

    /// Ordered member events of a conversation, rendered to one text block
    /// for the analysis prompt.
    pub async fn conversation_text(&self, conversation_id: &str) -> Result<Option<String>> {
        let rows = sqlx::query(
            "SELECT e.timestamp, e.direction, e.content FROM conversation_events ce
             JOIN events e ON e.id = ce.event_id
             WHERE ce.conversation_id = ?
             ORDER BY ce.position",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await
        .context("failed to load conversation text")?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut text = String::new();
        for row in rows {
            let timestamp: i64 = row.try_get("timestamp").unwrap_or(0);
            let direction: String = row.try_get("direction").unwrap_or_default();
            let content: Option<String> = row.try_get("content").ok();
            if let Some(content) = content {
                use std::fmt::Write as _;
                let _ = writeln!(text, "[{timestamp}] {direction}: {content}");
            }
        }
        Ok(Some(text))
    }

    /// Persons participating in a conversation's events, deduplicated.
    pub async fn conversation_participants(&self, conversation_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT p.person_id FROM conversation_events ce
             JOIN participants p ON p.event_id = ce.event_id
             WHERE ce.conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await
        .context("failed to list conversation participants")
        .map_err(Into::into)
    }
}
