//! Facet consumption and unattributed-fact resolution: analysis facets fold
//! into person facts (or the unattributed pool), and after each merge wave
//! candidate sets that collapse to a single active person are attributed
//! automatically.

use crate::error::Result;
use crate::store::facts::{self, FactSource, UnattributedFact};
use crate::store::Store;
use crate::{new_id, now_ts};
use anyhow::Context as _;
use std::collections::BTreeSet;

/// Facet types the resolver folds into person facts, with their fact
/// binding.
fn fact_binding(facet_type: &str) -> Option<(&'static str, &'static str)> {
    match facet_type {
        "mentioned_employer" => Some(("work", "employer")),
        "mentioned_city" => Some(("profile", "city")),
        "mentioned_person" => Some(("social", "knows")),
        _ => None,
    }
}

/// Fold analysis facets into facts. A facet whose conversation has exactly
/// one counterpart person attaches directly; otherwise it lands in the
/// unattributed pool with the participants as candidates. Idempotent: facts
/// dedupe on their natural key and pool entries on the facet id recorded in
/// their context.
pub async fn fold_facets(store: &Store) -> Result<usize> {
    let facets = store.facets_with_conversations().await?;
    let mut folded = 0;

    for (facet, conversation_id) in facets {
        let Some((category, fact_type)) = fact_binding(&facet.facet_type) else {
            continue;
        };

        let mut participants = BTreeSet::new();
        for person in store.conversation_participants(&conversation_id).await? {
            participants.insert(store.find_root(&person).await?);
        }

        if participants.len() == 1 {
            let person_id = participants.into_iter().next().expect("one participant");
            let mut tx = store.begin().await?;
            let inserted = facts::insert_fact(
                &mut tx,
                &person_id,
                category,
                fact_type,
                &facet.value,
                facet.confidence,
                FactSource::Analysis,
                Some(serde_json::json!({ "facet": facet.id, "conversation": conversation_id })),
            )
            .await?;
            tx.commit().await.context("failed to commit folded fact")?;
            folded += inserted as usize;
            continue;
        }

        // Ambiguous ownership: pool it, keyed on the facet id so re-folding
        // never duplicates.
        let context = format!("facet:{}", facet.id);
        let already: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM unattributed_facts WHERE context = ?",
        )
        .bind(&context)
        .fetch_one(store.pool())
        .await
        .context("failed to check pool for facet")?;
        if already > 0 {
            continue;
        }

        let mut tx = store.begin().await?;
        facts::insert_unattributed(
            &mut tx,
            &UnattributedFact {
                id: new_id(),
                category: category.to_string(),
                fact_type: fact_type.to_string(),
                value: facet.value.clone(),
                confidence: facet.confidence,
                shared_by_person_id: None,
                context: Some(context),
                candidate_person_ids: participants.into_iter().collect(),
                resolved_person_id: None,
                created_at: now_ts(),
            },
        )
        .await?;
        tx.commit().await.context("failed to commit pooled facet")?;
        folded += 1;
    }

    Ok(folded)
}

/// Attribute every unresolved fact whose candidate set collapses to exactly
/// one active person. Returns the number attributed.
pub async fn auto_attribute(store: &Store) -> Result<usize> {
    let pending = store.unresolved_facts(10_000).await?;
    let mut attributed = 0;

    for fact in pending {
        let mut roots = BTreeSet::new();
        for candidate in &fact.candidate_person_ids {
            match store.find_root(candidate).await {
                Ok(root) => {
                    roots.insert(root);
                }
                Err(_) => {
                    // A candidate that no longer exists carries no signal.
                    continue;
                }
            }
        }

        if roots.len() == 1 {
            let person_id = roots.into_iter().next().expect("one root");
            store.attribute_fact(&fact.id, &person_id).await?;
            tracing::debug!(fact = %fact.id, person = %person_id, "auto-attributed fact");
            attributed += 1;
        }
    }

    Ok(attributed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::proposals::ProposalType;
    use crate::Channel;

    #[tokio::test]
    async fn facet_with_single_counterpart_folds_into_a_fact() {
        let store = Store::in_memory().await.expect("store");

        // One event from one sender, chunked into one conversation.
        let ingest = crate::resolve::extract::ingest_event(
            &store,
            &crate::store::events::NewEvent {
                channel: Channel::Sms,
                adapter: "eve".to_string(),
                external_id: "m-1".to_string(),
                timestamp: 1_000,
                content_types: vec![],
                content: Some("started at initrode last week".to_string()),
                direction: crate::Direction::Received,
                thread_id: None,
                reply_to: None,
                payload_hash: None,
            },
            &[crate::resolve::extract::ParticipantSpec::single(
                Channel::Sms,
                "+15550001111",
                Some("Sam".to_string()),
                crate::Role::Sender,
            )],
        )
        .await
        .expect("ingest");

        crate::chunker::define(
            &store,
            "sms-gaps",
            Some("sms"),
            "time_gap",
            serde_json::json!({}),
            None,
        )
        .await
        .expect("define");
        let mut tx = store.begin().await.expect("begin");
        let conversation_id = crate::store::conversations::upsert_conversation(
            &mut tx,
            "sms-gaps",
            Some("sms"),
            None,
            &[ingest.event_id.clone()],
            1_000,
            1_000,
        )
        .await
        .expect("conversation");
        tx.commit().await.expect("commit");

        // A succeeded run with one employer facet.
        store
            .upsert_analysis_type(&crate::compute::default_analysis_type("m"))
            .await
            .expect("type");
        let mut tx = store.begin().await.expect("begin");
        crate::store::analysis::apply_run(
            &mut tx,
            &conversation_id,
            "conversation_insights",
            &serde_json::json!({ "topics": [], "sentiment": "neutral" }),
            &[(
                "mentioned_employer".to_string(),
                "Initrode".to_string(),
                0.7,
                "people[0].employer".to_string(),
            )],
        )
        .await
        .expect("run");
        tx.commit().await.expect("commit");

        assert_eq!(fold_facets(&store).await.expect("fold"), 1);
        // Re-folding is idempotent.
        assert_eq!(fold_facets(&store).await.expect("fold again"), 0);

        let person = store
            .participants_for_event(&ingest.event_id)
            .await
            .expect("participants")[0]
            .0
            .clone();
        let fact = store
            .best_fact(&person, "employer")
            .await
            .expect("query")
            .expect("fact exists");
        assert_eq!(fact.value, "Initrode");
        assert_eq!(fact.source, FactSource::Analysis);
    }

    #[tokio::test]
    async fn candidates_collapsing_after_merge_resolve_automatically() {
        let store = Store::in_memory().await.expect("store");
        let a = store
            .attach_person(Channel::Email, "a@x.com", Some("Ana"))
            .await
            .expect("attach a");
        let b = store
            .attach_person(Channel::Email, "b@x.com", Some("Ana B"))
            .await
            .expect("attach b");

        let mut tx = store.begin().await.expect("begin");
        crate::store::facts::insert_unattributed(
            &mut tx,
            &UnattributedFact {
                id: new_id(),
                category: "work".to_string(),
                fact_type: "employer".to_string(),
                value: "Initrode".to_string(),
                confidence: 0.8,
                shared_by_person_id: None,
                context: Some("mentioned changing jobs".to_string()),
                candidate_person_ids: vec![a.person_id.clone(), b.person_id.clone()],
                resolved_person_id: None,
                created_at: now_ts(),
            },
        )
        .await
        .expect("insert unattributed");
        tx.commit().await.expect("commit");

        // Two live candidates: nothing resolves yet.
        assert_eq!(auto_attribute(&store).await.expect("pass 1"), 0);

        crate::resolve::merge::execute_merge(
            &store,
            &b.person_id,
            &a.person_id,
            ProposalType::SoftAccum,
            0.7,
        )
        .await
        .expect("merge");

        // Candidates now collapse to one root.
        assert_eq!(auto_attribute(&store).await.expect("pass 2"), 1);
        assert!(store.unresolved_facts(10).await.expect("list").is_empty());

        let facts = store.facts_for_person(&a.person_id).await.expect("facts");
        assert!(facts.iter().any(|f| f.fact_type == "employer" && f.value == "Initrode"));
    }
}
