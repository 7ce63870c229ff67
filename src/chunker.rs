//! Conversation chunker: groups events into conversations per a stored,
//! named definition. Runs are idempotent; conversations key on
//! (definition, first event id).

use crate::bus;
use crate::error::{ConfigError, Result};
use crate::store::conversations::{self, ChunkDefinition};
use crate::store::Store;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::collections::BTreeMap;

/// Default time-gap split, one hour.
const DEFAULT_GAP_SECONDS: i64 = 3_600;

/// What one chunker run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReport {
    pub definition: String,
    pub conversations: usize,
    pub events: usize,
}

/// One event's chunking-relevant fields.
#[derive(Debug, Clone)]
struct ChunkEvent {
    id: String,
    timestamp: i64,
    thread_id: Option<String>,
    channel: String,
    participants: Vec<String>,
}

/// Run a stored definition over the event store.
pub async fn run(store: &Store, definition_name: &str) -> Result<ChunkReport> {
    let definition = store
        .get_chunk_definition(definition_name)
        .await?
        .ok_or_else(|| {
            ConfigError::Invalid(format!("unknown chunk definition: {definition_name}"))
        })?;

    let events = load_events(store, definition.channel.as_deref()).await?;
    let groups = match definition.strategy.as_str() {
        "time_gap" => {
            let gap = definition
                .config
                .get("gap_seconds")
                .and_then(|v| v.as_i64())
                .unwrap_or(DEFAULT_GAP_SECONDS);
            split_time_gap(&events, gap)
        }
        "native_thread" => split_native_thread(&events),
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown chunk strategy: {other}"
            ))
            .into());
        }
    };

    let mut report = ChunkReport {
        definition: definition.name.clone(),
        conversations: 0,
        events: 0,
    };

    for group in groups {
        if group.is_empty() {
            continue;
        }
        let started_at = group.first().expect("non-empty").timestamp;
        let ended_at = group.last().expect("non-empty").timestamp;
        let thread_id = group.first().and_then(|e| e.thread_id.clone());
        let member_ids: Vec<String> = group.iter().map(|e| e.id.clone()).collect();

        let mut tx = store.begin().await?;
        conversations::upsert_conversation(
            &mut tx,
            &definition.name,
            definition.channel.as_deref(),
            thread_id.as_deref(),
            &member_ids,
            started_at,
            ended_at,
        )
        .await?;
        tx.commit().await.context("failed to commit conversation")?;

        report.conversations += 1;
        report.events += member_ids.len();
    }

    store
        .publish_bus_event(
            bus::CONVERSATIONS_CHUNKED,
            None,
            None,
            serde_json::json!({
                "definition": report.definition,
                "conversations": report.conversations,
            }),
        )
        .await?;

    Ok(report)
}

async fn load_events(store: &Store, channel: Option<&str>) -> Result<Vec<ChunkEvent>> {
    let rows = match channel {
        Some(channel) => {
            sqlx::query(
                "SELECT id, timestamp, thread_id, channel FROM events
                 WHERE channel = ? ORDER BY timestamp, id",
            )
            .bind(channel)
            .fetch_all(store.pool())
            .await
        }
        None => {
            sqlx::query("SELECT id, timestamp, thread_id, channel FROM events ORDER BY timestamp, id")
                .fetch_all(store.pool())
                .await
        }
    }
    .context("failed to load events for chunking")?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id").context("failed to read event id")?;
        let participants = store
            .participants_for_event(&id)
            .await?
            .into_iter()
            .map(|(person, _)| person)
            .collect();
        events.push(ChunkEvent {
            id,
            timestamp: row.try_get("timestamp").context("failed to read timestamp")?,
            thread_id: row.try_get("thread_id").ok(),
            channel: row.try_get("channel").context("failed to read channel")?,
            participants,
        });
    }
    Ok(events)
}

/// Scope key for time-gap chunking: the native thread when present,
/// otherwise the sorted participant set within the channel.
fn scope_key(event: &ChunkEvent) -> String {
    if let Some(thread) = &event.thread_id {
        return format!("thread:{thread}");
    }
    let mut participants = event.participants.clone();
    participants.sort();
    format!("{}:{}", event.channel, participants.join("|"))
}

fn split_time_gap(events: &[ChunkEvent], gap_seconds: i64) -> Vec<Vec<ChunkEvent>> {
    let mut scopes: BTreeMap<String, Vec<ChunkEvent>> = BTreeMap::new();
    for event in events {
        scopes.entry(scope_key(event)).or_default().push(event.clone());
    }

    let mut groups = Vec::new();
    for (_, scoped) in scopes {
        let mut current: Vec<ChunkEvent> = Vec::new();
        for event in scoped {
            if let Some(previous) = current.last()
                && event.timestamp - previous.timestamp > gap_seconds
            {
                groups.push(std::mem::take(&mut current));
            }
            current.push(event);
        }
        if !current.is_empty() {
            groups.push(current);
        }
    }
    groups
}

fn split_native_thread(events: &[ChunkEvent]) -> Vec<Vec<ChunkEvent>> {
    let mut threads: BTreeMap<String, Vec<ChunkEvent>> = BTreeMap::new();
    for event in events {
        let Some(thread) = &event.thread_id else {
            continue;
        };
        threads.entry(thread.clone()).or_default().push(event.clone());
    }
    threads.into_values().collect()
}

/// Store (or update) a definition row.
pub async fn define(
    store: &Store,
    name: &str,
    channel: Option<&str>,
    strategy: &str,
    config: serde_json::Value,
    description: Option<&str>,
) -> Result<()> {
    if !matches!(strategy, "time_gap" | "native_thread") {
        return Err(ConfigError::Invalid(format!("unknown chunk strategy: {strategy}")).into());
    }
    store
        .upsert_chunk_definition(&ChunkDefinition {
            name: name.to_string(),
            channel: channel.map(str::to_string),
            strategy: strategy.to_string(),
            config,
            description: description.map(str::to_string),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::extract::{ingest_event, ParticipantSpec};
    use crate::store::events::NewEvent;
    use crate::{Channel, Direction, Role};

    async fn seed_events(store: &Store, timestamps: &[i64]) {
        for (index, ts) in timestamps.iter().enumerate() {
            ingest_event(
                store,
                &NewEvent {
                    channel: Channel::Sms,
                    adapter: "eve".to_string(),
                    external_id: format!("m-{index}"),
                    timestamp: *ts,
                    content_types: vec![],
                    content: Some(format!("msg {index}")),
                    direction: Direction::Received,
                    thread_id: None,
                    reply_to: None,
                    payload_hash: None,
                },
                &[ParticipantSpec::single(
                    Channel::Sms,
                    "+15550001111",
                    None,
                    Role::Sender,
                )],
            )
            .await
            .expect("ingest");
        }
    }

    #[tokio::test]
    async fn time_gap_splits_on_silence() {
        let store = Store::in_memory().await.expect("store");
        // Two bursts separated by two hours.
        seed_events(&store, &[1_000, 1_300, 1_600, 9_000, 9_200]).await;

        define(
            &store,
            "sms-gaps",
            Some("sms"),
            "time_gap",
            serde_json::json!({ "gap_seconds": 3600 }),
            None,
        )
        .await
        .expect("define");

        let report = run(&store, "sms-gaps").await.expect("run");
        assert_eq!(report.conversations, 2);
        assert_eq!(report.events, 5);

        let conversations = store
            .conversations_for_definition("sms-gaps")
            .await
            .expect("list");
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].event_count, 3);
        assert_eq!(conversations[1].event_count, 2);
    }

    #[tokio::test]
    async fn rerun_produces_identical_rows() {
        let store = Store::in_memory().await.expect("store");
        seed_events(&store, &[1_000, 1_300, 9_000]).await;
        define(
            &store,
            "sms-gaps",
            Some("sms"),
            "time_gap",
            serde_json::json!({ "gap_seconds": 3600 }),
            None,
        )
        .await
        .expect("define");

        let first = run(&store, "sms-gaps").await.expect("run");
        let first_rows = store
            .conversations_for_definition("sms-gaps")
            .await
            .expect("list");

        let second = run(&store, "sms-gaps").await.expect("run again");
        let second_rows = store
            .conversations_for_definition("sms-gaps")
            .await
            .expect("list");

        assert_eq!(first.conversations, second.conversations);
        assert_eq!(first_rows.len(), second_rows.len());
        for (a, b) in first_rows.iter().zip(&second_rows) {
            assert_eq!(a.id, b.id, "conversation ids must be stable across runs");
            assert_eq!(a.event_count, b.event_count);
        }

        // Member positions never duplicate.
        let duplicates: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM (
                 SELECT conversation_id, position, COUNT(*) AS n
                 FROM conversation_events GROUP BY 1, 2 HAVING n > 1
             )",
        )
        .fetch_one(store.pool())
        .await
        .expect("count");
        assert_eq!(duplicates, 0);
    }

    #[tokio::test]
    async fn native_thread_groups_by_external_thread() {
        let store = Store::in_memory().await.expect("store");

        for (index, thread) in [("a", "t1"), ("b", "t1"), ("c", "t2")] {
            let mut tx = store.begin().await.expect("begin");
            let thread_id = crate::store::events::upsert_thread(
                &mut tx,
                Channel::Gmail,
                thread,
                None,
            )
            .await
            .expect("thread");
            tx.commit().await.expect("commit");

            ingest_event(
                &store,
                &NewEvent {
                    channel: Channel::Gmail,
                    adapter: "gogcli".to_string(),
                    external_id: format!("g-{index}"),
                    timestamp: 1_000,
                    content_types: vec![],
                    content: Some("mail".to_string()),
                    direction: Direction::Received,
                    thread_id: Some(thread_id),
                    reply_to: None,
                    payload_hash: None,
                },
                &[] as &[ParticipantSpec],
            )
            .await
            .expect("ingest");
        }

        define(
            &store,
            "gmail-threads",
            Some("gmail"),
            "native_thread",
            serde_json::json!({}),
            None,
        )
        .await
        .expect("define");

        let report = run(&store, "gmail-threads").await.expect("run");
        assert_eq!(report.conversations, 2);
    }
}
