//! Microblog adapter: ingests an exported archive JSON from the data
//! directory. Posts are observed events authored by their handle.

use crate::adapter::{Adapter, AdapterResult, Readiness, SyncContext};
use crate::error::Result;
use crate::resolve::extract::{ingest_event, ParticipantSpec};
use crate::store::events::NewEvent;
use crate::{Channel, Direction, Role};
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    /// Unix seconds.
    created_at: i64,
    text: String,
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    reply_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    handle: String,
    #[serde(default)]
    name: Option<String>,
}

pub struct BirdAdapter {
    name: String,
    archive_path: PathBuf,
}

impl BirdAdapter {
    pub fn new(name: &str, data_dir: &std::path::Path) -> Self {
        Self {
            name: name.to_string(),
            archive_path: data_dir.join("bird").join("archive.json"),
        }
    }
}

#[async_trait]
impl Adapter for BirdAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "bird"
    }

    async fn prerequisites(&self) -> Readiness {
        if self.archive_path.is_file() {
            Readiness::Ready
        } else {
            Readiness::Missing {
                what: format!("archive {}", self.archive_path.display()),
                remediation: "export the microblog archive into the data directory".to_string(),
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

        let raw = std::fs::read_to_string(&self.archive_path)
            .with_context(|| format!("failed to read {}", self.archive_path.display()))?;
        let posts: Vec<Post> = serde_json::from_str(&raw).context("invalid archive JSON")?;

        let mut result = AdapterResult::default();
        let mut max_ts = since;

        for post in posts {
            ctx.check_cancelled()?;
            if post.created_at <= since {
                continue;
            }

            let participants: Vec<ParticipantSpec> = post
                .author
                .iter()
                .map(|author| {
                    ParticipantSpec::single(
                        Channel::Bird,
                        author.handle.clone(),
                        author.name.clone(),
                        Role::Sender,
                    )
                })
                .collect();

            let outcome = ingest_event(
                &ctx.store,
                &NewEvent {
                    channel: Channel::Bird,
                    adapter: self.name.clone(),
                    external_id: post.id.clone(),
                    timestamp: post.created_at,
                    content_types: vec!["text/plain".to_string()],
                    content: Some(post.text.clone()),
                    direction: Direction::Observed,
                    thread_id: None,
                    reply_to: post.reply_to.clone(),
                    payload_hash: Some(crate::fingerprint(post.text.as_bytes())),
                },
                &participants,
            )
            .await?;

            if outcome.created {
                result.events_created += 1;
            }
            result.persons_created += outcome.persons_created;
            max_ts = max_ts.max(post.created_at);
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.cursor = Some(max_ts.to_string());
        Ok(result)
    }
}
