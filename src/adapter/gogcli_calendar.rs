//! Calendar adapter: ingests `gogcli calendar list --json` events as
//! observed communication acts with attendee participants.

use crate::adapter::gogcli::binary_on_path;
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

#[derive(Debug, Deserialize)]
struct CalendarEvent {
    id: String,
    /// Unix seconds.
    start: i64,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    attendees: Vec<Attendee>,
}

#[derive(Debug, Deserialize)]
struct Attendee {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

pub struct GogcliCalendarAdapter {
    name: String,
    account: String,
}

impl GogcliCalendarAdapter {
    pub fn new(name: &str, options: &AdapterOptions) -> Result<Self> {
        let account = options.account.clone().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "adapter {name} (gogcli_calendar) requires options.account"
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            account,
        })
    }
}

#[async_trait]
impl Adapter for GogcliCalendarAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "gogcli_calendar"
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
        let after: i64 = if full {
            0
        } else {
            ctx.cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0)
        };

        ctx.report("fetching", serde_json::json!({ "after": after })).await?;
        ctx.check_cancelled()?;

        let output = tokio::process::Command::new("gogcli")
            .arg("calendar")
            .arg("list")
            .arg("--account")
            .arg(&self.account)
            .arg("--json")
            .output()
            .await
            .context("failed to run gogcli; is it installed?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Other(anyhow::anyhow!(
                "gogcli calendar list failed for {}: {}",
                self.account,
                stderr.trim()
            ))
            .into());
        }
        let events: Vec<CalendarEvent> = serde_json::from_slice(&output.stdout)
            .context("gogcli calendar list produced invalid JSON")?;

        let mut result = AdapterResult::default();
        let mut max_start = after;

        for event in events {
            ctx.check_cancelled()?;
            if event.start <= after {
                continue;
            }

            let participants: Vec<ParticipantSpec> = event
                .attendees
                .iter()
                .map(|attendee| {
                    ParticipantSpec::single(
                        Channel::Email,
                        attendee.email.clone(),
                        attendee.name.clone(),
                        Role::Observer,
                    )
                })
                .collect();

            let outcome = ingest_event(
                &ctx.store,
                &NewEvent {
                    channel: Channel::Calendar,
                    adapter: self.name.clone(),
                    external_id: event.id.clone(),
                    timestamp: event.start,
                    content_types: vec!["text/plain".to_string()],
                    content: event.summary.clone(),
                    direction: Direction::Observed,
                    thread_id: None,
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
            max_start = max_start.max(event.start);
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.cursor = Some(max_start.to_string());
        Ok(result)
    }
}
