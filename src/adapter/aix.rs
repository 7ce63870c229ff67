//! AI coding-session adapter: ingests JSONL transcripts from a source
//! directory. Each line is one session turn; files append over time, so the
//! cursor is the highest turn timestamp already ingested.

use crate::adapter::{Adapter, AdapterResult, Readiness, SyncContext};
use crate::config::AdapterOptions;
use crate::error::{ConfigError, Result};
use crate::resolve::extract::{ingest_event, ParticipantSpec};
use crate::store::events::NewEvent;
use crate::{Channel, Direction};
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Instant;

/// One transcript line.
#[derive(Debug, Deserialize)]
struct SessionTurn {
    id: String,
    session: String,
    timestamp: i64,
    role: String,
    text: String,
}

pub struct AixAdapter {
    name: String,
    source: PathBuf,
}

impl AixAdapter {
    pub fn new(name: &str, options: &AdapterOptions) -> Result<Self> {
        let source = options.source.clone().ok_or_else(|| {
            ConfigError::Invalid(format!("adapter {name} (aix) requires options.source"))
        })?;
        Ok(Self {
            name: name.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Adapter for AixAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "aix"
    }

    async fn prerequisites(&self) -> Readiness {
        if self.source.is_dir() {
            Readiness::Ready
        } else {
            Readiness::Missing {
                what: format!("source directory {}", self.source.display()),
                remediation: "point options.source at the session transcript directory".to_string(),
            }
        }
    }

    async fn sync(&self, ctx: &SyncContext, full: bool) -> Result<AdapterResult> {
        let started = Instant::now();
        let since: i64 = if full {
            0
        } else {
            ctx.cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0)
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.source)
            .with_context(|| format!("failed to read {}", self.source.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        paths.sort();

        let mut result = AdapterResult::default();
        let mut max_ts = since;
        let mut skipped_lines: u64 = 0;

        for (index, path) in paths.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.report(
                "reading",
                serde_json::json!({ "file": index + 1, "of": paths.len() }),
            )
            .await?;

            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;

            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let Ok(turn) = serde_json::from_str::<SessionTurn>(line) else {
                    skipped_lines += 1;
                    continue;
                };
                if turn.timestamp <= since {
                    continue;
                }

                let mut tx = ctx.store.begin().await?;
                let thread_id = crate::store::events::upsert_thread(
                    &mut tx,
                    Channel::Aix,
                    &turn.session,
                    None,
                )
                .await?;
                tx.commit().await.context("failed to commit thread")?;

                let outcome = ingest_event(
                    &ctx.store,
                    &NewEvent {
                        channel: Channel::Aix,
                        adapter: self.name.clone(),
                        external_id: turn.id.clone(),
                        timestamp: turn.timestamp,
                        content_types: vec!["text/plain".to_string()],
                        content: Some(format!("{}: {}", turn.role, turn.text)),
                        direction: Direction::Observed,
                        thread_id: Some(thread_id),
                        reply_to: None,
                        payload_hash: Some(crate::fingerprint(line.as_bytes())),
                    },
                    &[] as &[ParticipantSpec],
                )
                .await?;

                if outcome.created {
                    result.events_created += 1;
                }
                max_ts = max_ts.max(turn.timestamp);
            }
        }

        result.threads = paths.len() as u64;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.cursor = Some(max_ts.to_string());
        if skipped_lines > 0 {
            result
                .perf
                .insert("skipped_lines".to_string(), serde_json::json!(skipped_lines));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tokio_util::sync::CancellationToken;

    fn write_session(dir: &std::path::Path, name: &str, turns: &[(&str, i64)]) {
        let mut body = String::new();
        for (id, ts) in turns {
            body.push_str(
                &serde_json::json!({
                    "id": id,
                    "session": name,
                    "timestamp": ts,
                    "role": "user",
                    "text": "refactor the parser",
                })
                .to_string(),
            );
            body.push('\n');
        }
        std::fs::write(dir.join(format!("{name}.jsonl")), body).expect("write transcript");
    }

    #[tokio::test]
    async fn incremental_resumes_from_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_session(dir.path(), "s1", &[("t1", 100), ("t2", 200)]);

        let store = Store::in_memory().await.expect("store");
        store.claim_sync_job("aix", 300).await.expect("claim");
        let adapter = AixAdapter {
            name: "aix".to_string(),
            source: dir.path().to_path_buf(),
        };

        let ctx = SyncContext::new(
            store.clone(),
            "aix",
            None,
            CancellationToken::new(),
            300,
        );
        let first = adapter.sync(&ctx, false).await.expect("sync");
        assert_eq!(first.events_created, 2);
        assert_eq!(first.cursor.as_deref(), Some("200"));

        // New turn appended; resume picks up only the new one.
        write_session(dir.path(), "s1", &[("t1", 100), ("t2", 200), ("t3", 300)]);
        let ctx = SyncContext::new(
            store.clone(),
            "aix",
            first.cursor.clone(),
            CancellationToken::new(),
            300,
        );
        let second = adapter.sync(&ctx, false).await.expect("sync");
        assert_eq!(second.events_created, 1);
        assert_eq!(store.count_events().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn full_rerun_converges_to_same_event_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_session(dir.path(), "s1", &[("t1", 100), ("t2", 200)]);

        let store = Store::in_memory().await.expect("store");
        store.claim_sync_job("aix", 300).await.expect("claim");
        let adapter = AixAdapter {
            name: "aix".to_string(),
            source: dir.path().to_path_buf(),
        };

        for _ in 0..2 {
            let ctx = SyncContext::new(
                store.clone(),
                "aix",
                None,
                CancellationToken::new(),
                300,
            );
            adapter.sync(&ctx, true).await.expect("sync");
        }
        assert_eq!(store.count_events().await.expect("count"), 2);
    }
}
