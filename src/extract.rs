//! PII extraction: scan event content for email addresses and phone numbers
//! and fold them into the fact graph.

use crate::error::Result;
use crate::store::events::Event;
use crate::store::facts::{self, FactSource, UnattributedFact};
use crate::store::Store;
use crate::{new_id, now_ts, Channel, Role};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Bounds what `pii` scans.
#[derive(Debug, Clone, Default)]
pub struct PiiFilter {
    pub channel: Option<Channel>,
    pub since: Option<i64>,
}

/// What one extraction run found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiReport {
    pub events_scanned: usize,
    pub facts_written: u64,
    pub unattributed: u64,
    pub dry_run: bool,
}

fn email_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
            .expect("email pattern compiles")
    })
}

fn phone_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"\+?1?[-. (]*\d{3}[-. )]*\d{3}[-. ]*\d{4}\b")
            .expect("phone pattern compiles")
    })
}

/// Scan matching events for PII and attach the hits as facts on the sender,
/// or into the unattributed pool when no sender resolves. With `dry_run` the
/// store is left untouched and only the counts are reported.
pub async fn pii(store: &Store, filter: &PiiFilter, dry_run: bool) -> Result<PiiReport> {
    let events = load_events(store, filter).await?;
    let mut report = PiiReport {
        events_scanned: events.len(),
        facts_written: 0,
        unattributed: 0,
        dry_run,
    };

    for event in &events {
        let Some(content) = &event.content else {
            continue;
        };

        let mut hits: Vec<(&'static str, String)> = Vec::new();
        for capture in email_pattern().find_iter(content) {
            hits.push((
                "email_address",
                crate::resolve::normalize::normalize_identifier(Channel::Email, capture.as_str()),
            ));
        }
        for capture in phone_pattern().find_iter(content) {
            let normalized =
                crate::resolve::normalize::normalize_identifier(Channel::Sms, capture.as_str());
            // Only keep hits that normalized into a plausible number.
            if normalized.starts_with('+') {
                hits.push(("phone_number", normalized));
            }
        }
        if hits.is_empty() {
            continue;
        }

        let participants = store.participants_for_event(&event.id).await?;
        let sender = participants
            .iter()
            .find(|(_, role)| *role == Role::Sender)
            .map(|(person, _)| person.clone());

        for (fact_type, value) in hits {
            if dry_run {
                report.facts_written += 1;
                continue;
            }
            match &sender {
                Some(person_id) => {
                    let evidence = serde_json::json!({ "event": event.id });
                    let mut tx = store.begin().await?;
                    facts::insert_fact(
                        &mut tx,
                        person_id,
                        "contact",
                        fact_type,
                        &value,
                        0.6,
                        FactSource::Import,
                        Some(evidence),
                    )
                    .await?;
                    tx.commit().await.context("failed to commit PII fact")?;
                    report.facts_written += 1;
                }
                None => {
                    let candidates: Vec<String> =
                        participants.iter().map(|(person, _)| person.clone()).collect();
                    let mut tx = store.begin().await?;
                    facts::insert_unattributed(
                        &mut tx,
                        &UnattributedFact {
                            id: new_id(),
                            category: "contact".to_string(),
                            fact_type: fact_type.to_string(),
                            value,
                            confidence: 0.5,
                            shared_by_person_id: None,
                            context: Some(format!("found in event {}", event.id)),
                            candidate_person_ids: candidates,
                            resolved_person_id: None,
                            created_at: now_ts(),
                        },
                    )
                    .await?;
                    tx.commit().await.context("failed to commit unattributed PII")?;
                    report.unattributed += 1;
                }
            }
        }
    }

    Ok(report)
}

async fn load_events(store: &Store, filter: &PiiFilter) -> Result<Vec<Event>> {
    match filter.channel {
        Some(channel) => store.events_for_channel(channel, filter.since).await,
        None => {
            let rows = sqlx::query("SELECT * FROM events WHERE timestamp >= ? ORDER BY timestamp")
                .bind(filter.since.unwrap_or(0))
                .fetch_all(store.pool())
                .await
                .context("failed to load events for PII scan")?;
            rows.into_iter()
                .map(crate::store::events::event_from_row)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::extract::{ingest_event, ParticipantSpec};
    use crate::store::events::NewEvent;
    use crate::Direction;

    async fn seed(store: &Store, content: &str) {
        ingest_event(
            store,
            &NewEvent {
                channel: Channel::Sms,
                adapter: "eve".to_string(),
                external_id: "m-1".to_string(),
                timestamp: 1_000,
                content_types: vec![],
                content: Some(content.to_string()),
                direction: Direction::Received,
                thread_id: None,
                reply_to: None,
                payload_hash: None,
            },
            &[ParticipantSpec::single(
                Channel::Sms,
                "+15550001111",
                Some("Sam".to_string()),
                Role::Sender,
            )],
        )
        .await
        .expect("ingest");
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let store = Store::in_memory().await.expect("store");
        seed(&store, "reach me at sam.new@initrode.com or (555) 867-5309").await;

        let report = pii(&store, &PiiFilter::default(), true).await.expect("scan");
        assert_eq!(report.facts_written, 2);

        // Nothing landed besides the ingest-time identity fact.
        let extra: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM facts WHERE source = 'import'",
        )
        .fetch_one(store.pool())
        .await
        .expect("count");
        assert_eq!(extra, 0);
    }

    #[tokio::test]
    async fn wet_run_attaches_facts_to_the_sender() {
        let store = Store::in_memory().await.expect("store");
        seed(&store, "my work address is sam.new@initrode.com").await;

        let report = pii(&store, &PiiFilter::default(), false).await.expect("scan");
        assert_eq!(report.facts_written, 1);
        assert_eq!(report.unattributed, 0);

        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM facts WHERE fact_type = 'email_address' AND source = 'import'",
        )
        .fetch_optional(store.pool())
        .await
        .expect("query");
        assert_eq!(value.as_deref(), Some("sam.new@initrode.com"));
    }
}
