//! Gmail adapter: drives the external `gogcli` CLI and ingests its JSON
//! message dumps. The cursor is the highest internal date seen, so an
//! incremental run asks the CLI only for newer mail.

use crate::adapter::{Adapter, AdapterResult, Readiness, SyncContext};
use crate::config::AdapterOptions;
use crate::error::{ConfigError, Result, SyncError};
use crate::resolve::extract::{ingest_event, ParticipantSpec};
use crate::store::events::NewEvent;
use crate::{Channel, Direction, Role};
use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

/// One message as `gogcli gmail list --json` prints it.
#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    /// Milliseconds since the unix epoch.
    #[serde(rename = "internalDate")]
    internal_date: i64,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    from: Option<Mailbox>,
    #[serde(default)]
    to: Vec<Mailbox>,
    #[serde(default)]
    cc: Vec<Mailbox>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Mailbox {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

pub struct GogcliAdapter {
    name: String,
    account: String,
    qps: Option<u32>,
}

impl GogcliAdapter {
    pub fn new(name: &str, options: &AdapterOptions) -> Result<Self> {
        let account = options.account.clone().ok_or_else(|| {
            ConfigError::Invalid(format!("adapter {name} (gogcli) requires options.account"))
        })?;
        Ok(Self {
            name: name.to_string(),
            account,
            qps: options.qps,
        })
    }

    async fn fetch_messages(&self, after_ms: i64) -> Result<Vec<GmailMessage>> {
        let mut command = tokio::process::Command::new("gogcli");
        command
            .arg("gmail")
            .arg("list")
            .arg("--account")
            .arg(&self.account)
            .arg("--json");
        if after_ms > 0 {
            command.arg("--after-ms").arg(after_ms.to_string());
        }
        if let Some(qps) = self.qps {
            command.arg("--qps").arg(qps.to_string());
        }

        let output = command
            .output()
            .await
            .context("failed to run gogcli; is it installed?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Other(anyhow::anyhow!(
                "gogcli gmail list failed for {}: {}",
                self.account,
                stderr.trim()
            ))
            .into());
        }

        serde_json::from_slice(&output.stdout)
            .context("gogcli gmail list produced invalid JSON")
            .map_err(Into::into)
    }
}

pub(crate) fn binary_on_path(binary: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
    })
}

#[async_trait]
impl Adapter for GogcliAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "gogcli"
    }

    async fn prerequisites(&self) -> Readiness {
        if binary_on_path("gogcli") {
            Readiness::Ready
        } else {
            Readiness::Missing {
                what: "gogcli binary".to_string(),
                remediation: "install gogcli and authenticate the account".to_string(),
            }
        }
    }

    async fn sync(&self, ctx: &SyncContext, full: bool) -> Result<AdapterResult> {
        let started = Instant::now();
        let after_ms: i64 = if full {
            0
        } else {
            ctx.cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0)
        };

        ctx.report("fetching", serde_json::json!({ "after_ms": after_ms }))
            .await?;
        ctx.check_cancelled()?;

        let messages = self.fetch_messages(after_ms).await?;
        let fetched = messages.len();
        let mut result = AdapterResult::default();
        let mut max_ms = after_ms;

        for (index, message) in messages.into_iter().enumerate() {
            ctx.check_cancelled()?;
            if index % 100 == 0 {
                ctx.report(
                    "ingesting",
                    serde_json::json!({ "done": index, "of": fetched }),
                )
                .await?;
            }

            let mut tx = ctx.store.begin().await?;
            let thread_id = crate::store::events::upsert_thread(
                &mut tx,
                Channel::Gmail,
                &message.thread_id,
                message.subject.as_deref(),
            )
            .await?;
            tx.commit().await.context("failed to commit thread")?;

            let sent = message.labels.iter().any(|l| l == "SENT");
            let mut participants = Vec::new();
            if let Some(from) = &message.from {
                participants.push(ParticipantSpec::single(
                    Channel::Gmail,
                    from.email.clone(),
                    from.name.clone(),
                    Role::Sender,
                ));
            }
            for to in &message.to {
                participants.push(ParticipantSpec::single(
                    Channel::Gmail,
                    to.email.clone(),
                    to.name.clone(),
                    Role::Recipient,
                ));
            }
            for cc in &message.cc {
                participants.push(ParticipantSpec::single(
                    Channel::Gmail,
                    cc.email.clone(),
                    cc.name.clone(),
                    Role::Cc,
                ));
            }

            let timestamp = message.internal_date / 1000;
            let outcome = ingest_event(
                &ctx.store,
                &NewEvent {
                    channel: Channel::Gmail,
                    adapter: self.name.clone(),
                    external_id: message.id.clone(),
                    timestamp,
                    content_types: vec!["text/plain".to_string()],
                    content: message.snippet.clone(),
                    direction: if sent { Direction::Sent } else { Direction::Received },
                    thread_id: Some(thread_id),
                    reply_to: None,
                    payload_hash: Some(crate::fingerprint(message.id.as_bytes())),
                },
                &participants,
            )
            .await?;

            if outcome.created {
                result.events_created += 1;
            }
            result.persons_created += outcome.persons_created;
            result.threads += 1;
            max_ms = max_ms.max(message.internal_date);
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.cursor = Some(max_ms.to_string());
        result.perf.insert("fetched".to_string(), serde_json::json!(fetched));
        Ok(result)
    }
}
