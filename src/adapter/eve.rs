//! iMessage/SMS adapter: reads the local Messages archive database directly.
//! The archive is opened read-only on a separate pool; the cursor is the last
//! ingested message ROWID.

use crate::adapter::{Adapter, AdapterResult, Readiness, SyncContext};
use crate::config::AdapterOptions;
use crate::error::Result;
use crate::resolve::extract::{ingest_event, ParticipantSpec};
use crate::store::events::NewEvent;
use crate::{Channel, Direction, Role};
use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row as _;
use std::path::PathBuf;
use std::time::Instant;

/// Seconds between the Apple epoch (2001-01-01) and the unix epoch.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

const FETCH_BATCH: i64 = 500;

pub struct EveAdapter {
    name: String,
    archive_path: PathBuf,
}

impl EveAdapter {
    pub fn new(name: &str, options: &AdapterOptions) -> Self {
        let archive_path = options.source.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Library/Messages/chat.db")
        });
        Self {
            name: name.to_string(),
            archive_path,
        }
    }

    async fn open_archive(&self) -> Result<sqlx::SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(&self.archive_path)
            .read_only(true)
            .immutable(false);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("failed to open Messages archive at {}", self.archive_path.display())
            })
            .map_err(Into::into)
    }
}

/// Apple stores dates as nanoseconds since 2001-01-01 (older archives used
/// seconds). Normalize either to unix seconds.
fn apple_to_unix(date: i64) -> i64 {
    if date > 1_000_000_000_000 {
        date / 1_000_000_000 + APPLE_EPOCH_OFFSET
    } else {
        date + APPLE_EPOCH_OFFSET
    }
}

#[async_trait]
impl Adapter for EveAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "eve"
    }

    async fn prerequisites(&self) -> Readiness {
        if self.archive_path.is_file() {
            Readiness::Ready
        } else {
            Readiness::Missing {
                what: format!("Messages archive {}", self.archive_path.display()),
                remediation: "grant Full Disk Access or set options.source".to_string(),
            }
        }
    }

    async fn sync(&self, ctx: &SyncContext, full: bool) -> Result<AdapterResult> {
        let started = Instant::now();
        let archive = self.open_archive().await?;

        let mut cursor: i64 = if full {
            0
        } else {
            ctx.cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0)
        };

        let mut result = AdapterResult::default();
        let mut batches: u64 = 0;

        loop {
            ctx.check_cancelled()?;

            let rows = sqlx::query(
                "SELECT m.ROWID AS rowid, m.guid, m.date, m.text, m.is_from_me,
                        h.id AS handle, h.service AS service,
                        c.chat_identifier, c.display_name
                 FROM message m
                 LEFT JOIN handle h ON h.ROWID = m.handle_id
                 LEFT JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
                 LEFT JOIN chat c ON c.ROWID = cmj.chat_id
                 WHERE m.ROWID > ?
                 ORDER BY m.ROWID
                 LIMIT ?",
            )
            .bind(cursor)
            .bind(FETCH_BATCH)
            .fetch_all(&archive)
            .await
            .context("failed to read Messages archive")?;

            if rows.is_empty() {
                break;
            }
            batches += 1;
            ctx.report(
                "fetching",
                serde_json::json!({ "cursor": cursor, "batch": batches }),
            )
            .await?;

            for row in rows {
                let rowid: i64 = row.try_get("rowid").context("failed to read rowid")?;
                cursor = cursor.max(rowid);

                let guid: String = row.try_get("guid").context("failed to read guid")?;
                let text: Option<String> = row.try_get("text").ok();
                let Some(text) = text.filter(|t| !t.is_empty()) else {
                    // Attachment-only or reaction rows carry no text body.
                    result.attachments += 1;
                    continue;
                };

                let date: i64 = row.try_get("date").unwrap_or(0);
                let is_from_me: i64 = row.try_get("is_from_me").unwrap_or(0);
                let handle: Option<String> = row.try_get("handle").ok();
                let service: Option<String> = row.try_get("service").ok();
                let chat: Option<String> = row.try_get("chat_identifier").ok();
                let chat_name: Option<String> = row.try_get("display_name").ok();

                let channel = match service.as_deref() {
                    Some("SMS") => Channel::Sms,
                    _ => Channel::Imessage,
                };

                let thread_id = match chat {
                    Some(chat) => {
                        let mut tx = ctx.store.begin().await?;
                        let id = crate::store::events::upsert_thread(
                            &mut tx,
                            channel,
                            &chat,
                            chat_name.as_deref().filter(|n| !n.is_empty()),
                        )
                        .await?;
                        tx.commit().await.context("failed to commit thread")?;
                        result.threads += 1;
                        Some(id)
                    }
                    None => None,
                };

                let participants: Vec<ParticipantSpec> = handle
                    .iter()
                    .map(|h| {
                        ParticipantSpec::single(
                            channel,
                            h.clone(),
                            None,
                            if is_from_me != 0 { Role::Recipient } else { Role::Sender },
                        )
                    })
                    .collect();

                let outcome = ingest_event(
                    &ctx.store,
                    &NewEvent {
                        channel,
                        adapter: self.name.clone(),
                        external_id: guid,
                        timestamp: apple_to_unix(date),
                        content_types: vec!["text/plain".to_string()],
                        content: Some(text),
                        direction: if is_from_me != 0 { Direction::Sent } else { Direction::Received },
                        thread_id,
                        reply_to: None,
                        payload_hash: None,
                    },
                    &participants,
                )
                .await?;

                if outcome.created {
                    result.events_created += 1;
                }
                result.persons_created += outcome.persons_created;
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.cursor = Some(cursor.to_string());
        result.perf.insert("batches".to_string(), serde_json::json!(batches));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_dates_normalize_to_unix_seconds() {
        // 2023-09-18T? in nanoseconds since the Apple epoch.
        let nanos = 716_500_000i64 * 1_000_000_000;
        assert_eq!(apple_to_unix(nanos), 716_500_000 + APPLE_EPOCH_OFFSET);
        // Legacy seconds-resolution archives.
        assert_eq!(apple_to_unix(716_500_000), 716_500_000 + APPLE_EPOCH_OFFSET);
    }
}
