//! Event ingestion: one event plus its participant identifiers, attached to
//! the person graph in a single transaction.
//!
//! This is the shared helper every adapter routes person creation through.

use crate::error::Result;
use crate::store::events::{self, InsertOutcome, NewEvent};
use crate::store::persons;
use crate::store::Store;
use crate::{Channel, Role};
use anyhow::Context as _;

/// One participant on an incoming event, before resolution. All of the
/// identifiers belong to the same actor, so they unify onto one person.
#[derive(Debug, Clone)]
pub struct ParticipantSpec {
    pub identifiers: Vec<(Channel, String)>,
    pub display_name: Option<String>,
    pub role: Role,
}

impl ParticipantSpec {
    /// The common case: an actor known by a single handle.
    pub fn single(
        channel: Channel,
        raw_identifier: impl Into<String>,
        display_name: Option<String>,
        role: Role,
    ) -> Self {
        Self {
            identifiers: vec![(channel, raw_identifier.into())],
            display_name,
            role,
        }
    }
}

/// What an ingest actually changed.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub event_id: String,
    pub created: bool,
    pub persons_created: u64,
}

/// Insert an event and attach every participant, creating one person per
/// previously unseen actor. Idempotent end to end: a re-run against the same
/// inputs changes nothing.
pub async fn ingest_event(
    store: &Store,
    event: &NewEvent,
    participants: &[ParticipantSpec],
) -> Result<IngestOutcome> {
    let mut tx = store.begin().await?;

    let (event_id, insert) = events::insert_event(&mut tx, event).await?;
    let mut outcome = IngestOutcome {
        event_id: event_id.clone(),
        created: insert == InsertOutcome::Created,
        persons_created: 0,
    };

    for spec in participants {
        let attach = persons::attach_person_identifiers(
            &mut tx,
            &spec.identifiers,
            spec.display_name.as_deref(),
        )
        .await?;
        if attach.created_person {
            outcome.persons_created += 1;
        }
        events::add_participant(&mut tx, &event_id, &attach.person_id, spec.role).await?;
    }

    tx.commit().await.context("failed to commit ingest")?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;

    fn event(external_id: &str) -> NewEvent {
        NewEvent {
            channel: Channel::Email,
            adapter: "gogcli".to_string(),
            external_id: external_id.to_string(),
            timestamp: 1_700_000_100,
            content_types: vec!["text/plain".to_string()],
            content: Some("see you tomorrow".to_string()),
            direction: Direction::Received,
            thread_id: None,
            reply_to: None,
            payload_hash: None,
        }
    }

    #[tokio::test]
    async fn one_actor_with_two_identifiers_makes_one_person() {
        let store = Store::in_memory().await.expect("store should open");

        let outcome = ingest_event(
            &store,
            &event("m-1"),
            &[ParticipantSpec {
                identifiers: vec![
                    (Channel::Email, "alice@x.com".to_string()),
                    (Channel::Sms, "+15551110000".to_string()),
                ],
                display_name: Some("Alice".to_string()),
                role: Role::Sender,
            }],
        )
        .await
        .expect("ingest");

        assert!(outcome.created);
        assert_eq!(outcome.persons_created, 1);

        let persons = store.list_active_persons().await.expect("list");
        assert_eq!(persons.len(), 1);
        let identities = store
            .identities_for_person(&persons[0].id)
            .await
            .expect("identities");
        assert_eq!(identities.len(), 2, "both handles belong to the one person");
    }

    #[tokio::test]
    async fn distinct_actors_still_make_distinct_persons() {
        let store = Store::in_memory().await.expect("store should open");

        let outcome = ingest_event(
            &store,
            &event("m-1"),
            &[
                ParticipantSpec::single(
                    Channel::Email,
                    "alice@x.com",
                    Some("Alice".to_string()),
                    Role::Sender,
                ),
                ParticipantSpec::single(Channel::Sms, "+15551110000", None, Role::Recipient),
            ],
        )
        .await
        .expect("ingest");

        assert_eq!(outcome.persons_created, 2);
    }

    #[tokio::test]
    async fn normalization_collapses_to_the_same_person() {
        let store = Store::in_memory().await.expect("store should open");

        let first = ingest_event(
            &store,
            &event("m-1"),
            &[ParticipantSpec::single(
                Channel::Email,
                "alice@x.com",
                None,
                Role::Sender,
            )],
        )
        .await
        .expect("ingest");
        assert_eq!(first.persons_created, 1);

        let second = ingest_event(
            &store,
            &event("m-2"),
            &[ParticipantSpec::single(
                Channel::Email,
                "ALICE@X.COM",
                None,
                Role::Sender,
            )],
        )
        .await
        .expect("ingest");
        assert!(second.created);
        assert_eq!(second.persons_created, 0);

        assert_eq!(
            store.list_active_persons().await.expect("list").len(),
            1,
            "case-folded identifier must not mint a second person"
        );
    }
}
