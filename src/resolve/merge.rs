//! Transactional merge execution: collapse `source` into `target` with full
//! lineage, dedup on natural keys, and a bus event, all under one write
//! transaction. Any failure rolls the whole merge back.

use crate::bus;
use crate::error::{ResolveError, Result};
use crate::now_ts;
use crate::store::facts::{self, FactSource};
use crate::store::persons::find_root;
use crate::store::proposals::{MergeProposal, ProposalType};
use crate::store::Store;
use anyhow::Context as _;
use sqlx::{Row as _, SqliteConnection};

/// Execute a merge of `source_id` into `target_id`. Returns false when the
/// two already share a root (nothing to do).
pub async fn execute_merge(
    store: &Store,
    source_id: &str,
    target_id: &str,
    proposal_type: ProposalType,
    score: f64,
) -> Result<bool> {
    let mut tx = store.begin().await?;

    let source = find_root(&mut tx, source_id).await?;
    let target = find_root(&mut tx, target_id).await?;
    if source == target {
        tx.commit().await.context("failed to commit no-op merge")?;
        return Ok(false);
    }

    move_identities(&mut tx, &source, &target).await?;
    move_participants(&mut tx, &source, &target).await?;
    move_facts(&mut tx, &source, &target).await?;
    move_tags(&mut tx, &source, &target).await?;
    move_unattributed(&mut tx, &source, &target).await?;
    repoint_proposals(&mut tx, &source, &target).await?;

    sqlx::query("UPDATE persons SET merged_into = ?, updated_at = ? WHERE id = ?")
        .bind(&target)
        .bind(now_ts())
        .bind(&source)
        .execute(&mut *tx)
        .await
        .context("failed to tombstone source person")?;

    bus::publish(
        &mut tx,
        bus::IDENTITY_MERGED,
        None,
        None,
        serde_json::json!({
            "source": source,
            "target": target,
            "type": proposal_type.as_str(),
            "score": score,
        }),
    )
    .await?;

    tx.commit().await.context("failed to commit merge")?;
    Ok(true)
}

/// Execute a merge described by an accepted proposal.
pub async fn execute_proposal(store: &Store, proposal: &MergeProposal) -> Result<bool> {
    if proposal.source_person_id == proposal.target_person_id {
        return Err(ResolveError::SelfMerge(proposal.source_person_id.clone()).into());
    }
    execute_merge(
        store,
        &proposal.source_person_id,
        &proposal.target_person_id,
        proposal.proposal_type,
        proposal.score,
    )
    .await
}

/// Move identities; a (channel, identifier) already on the target wins and
/// absorbs the source copy's id into its provenance.
async fn move_identities(tx: &mut SqliteConnection, source: &str, target: &str) -> Result<()> {
    let rows = sqlx::query(
        "SELECT id, channel, identifier, provenance FROM identities WHERE person_id = ?",
    )
    .bind(source)
    .fetch_all(&mut *tx)
    .await
    .context("failed to list source identities")?;

    for row in rows {
        let id: String = row.try_get("id").context("failed to read identity id")?;
        let channel: String = row.try_get("channel").context("failed to read channel")?;
        let identifier: String = row.try_get("identifier").context("failed to read identifier")?;
        let provenance: String = row.try_get("provenance").unwrap_or_else(|_| "[]".to_string());

        let duplicate: Option<(String, String)> = sqlx::query_as(
            "SELECT id, provenance FROM identities
             WHERE person_id = ? AND channel = ? AND identifier = ?",
        )
        .bind(target)
        .bind(&channel)
        .bind(&identifier)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to check target identity")?;

        match duplicate {
            Some((winner_id, winner_provenance)) => {
                let mut merged: Vec<String> =
                    serde_json::from_str(&winner_provenance).unwrap_or_default();
                let absorbed: Vec<String> = serde_json::from_str(&provenance).unwrap_or_default();
                merged.extend(absorbed);
                merged.push(id.clone());

                sqlx::query("UPDATE identities SET provenance = ? WHERE id = ?")
                    .bind(serde_json::to_string(&merged).context("failed to serialize provenance")?)
                    .bind(&winner_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to append provenance")?;
                sqlx::query("DELETE FROM identities WHERE id = ?")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to drop duplicate identity")?;
            }
            None => {
                sqlx::query("UPDATE identities SET person_id = ? WHERE id = ?")
                    .bind(target)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to move identity")?;
            }
        }
    }
    Ok(())
}

async fn move_participants(tx: &mut SqliteConnection, source: &str, target: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO participants (event_id, person_id, role)
         SELECT event_id, ?, role FROM participants WHERE person_id = ?",
    )
    .bind(target)
    .bind(source)
    .execute(&mut *tx)
    .await
    .context("failed to copy participant edges")?;

    sqlx::query("DELETE FROM participants WHERE person_id = ?")
        .bind(source)
        .execute(&mut *tx)
        .await
        .context("failed to drop source participant edges")?;
    Ok(())
}

/// Move facts with provenance preserved: a (type, value) duplicate on the
/// target keeps the higher confidence; the source row is dropped either way.
async fn move_facts(tx: &mut SqliteConnection, source: &str, target: &str) -> Result<()> {
    let rows = sqlx::query("SELECT * FROM facts WHERE person_id = ?")
        .bind(source)
        .fetch_all(&mut *tx)
        .await
        .context("failed to list source facts")?;

    for row in rows {
        let category: String = row.try_get("category").context("failed to read category")?;
        let fact_type: String = row.try_get("fact_type").context("failed to read fact_type")?;
        let value: String = row.try_get("value").context("failed to read value")?;
        let confidence: f64 = row.try_get("confidence").unwrap_or(0.0);
        let source_tag: String = row.try_get("source").context("failed to read source")?;
        let evidence: Option<String> = row.try_get("evidence").ok();

        facts::insert_fact(
            tx,
            target,
            &category,
            &fact_type,
            &value,
            confidence,
            FactSource::parse(&source_tag).unwrap_or(FactSource::Import),
            evidence.and_then(|e| serde_json::from_str(&e).ok()),
        )
        .await?;
    }

    sqlx::query("DELETE FROM facts WHERE person_id = ?")
        .bind(source)
        .execute(&mut *tx)
        .await
        .context("failed to drop source facts")?;
    Ok(())
}

async fn move_tags(tx: &mut SqliteConnection, source: &str, target: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO person_tags (person_id, tag)
         SELECT ?, tag FROM person_tags WHERE person_id = ?",
    )
    .bind(target)
    .bind(source)
    .execute(&mut *tx)
    .await
    .context("failed to copy tags")?;
    sqlx::query("DELETE FROM person_tags WHERE person_id = ?")
        .bind(source)
        .execute(&mut *tx)
        .await
        .context("failed to drop source tags")?;
    Ok(())
}

/// Re-point unattributed-fact attribution and candidate lists.
async fn move_unattributed(tx: &mut SqliteConnection, source: &str, target: &str) -> Result<()> {
    sqlx::query("UPDATE unattributed_facts SET shared_by_person_id = ? WHERE shared_by_person_id = ?")
        .bind(target)
        .bind(source)
        .execute(&mut *tx)
        .await
        .context("failed to re-point shared_by")?;

    let rows = sqlx::query(
        "SELECT id, candidate_person_ids FROM unattributed_facts
         WHERE resolved_person_id IS NULL AND candidate_person_ids LIKE '%' || ? || '%'",
    )
    .bind(source)
    .fetch_all(&mut *tx)
    .await
    .context("failed to list candidate references")?;

    for row in rows {
        let id: String = row.try_get("id").context("failed to read id")?;
        let raw: String = row.try_get("candidate_person_ids").unwrap_or_else(|_| "[]".to_string());
        let mut candidates: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        for candidate in &mut candidates {
            if candidate == source {
                *candidate = target.to_string();
            }
        }
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        sqlx::query("UPDATE unattributed_facts SET candidate_person_ids = ? WHERE id = ?")
            .bind(serde_json::to_string(&candidates).context("failed to serialize candidates")?)
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("failed to rewrite candidates")?;
    }
    Ok(())
}

/// Pending proposals referencing the tombstone move to the surviving root;
/// pairs that collapse onto themselves expire.
async fn repoint_proposals(tx: &mut SqliteConnection, source: &str, target: &str) -> Result<()> {
    sqlx::query(
        "UPDATE merge_proposals SET source_person_id = ?, updated_at = ?
         WHERE status = 'pending' AND source_person_id = ?",
    )
    .bind(target)
    .bind(now_ts())
    .bind(source)
    .execute(&mut *tx)
    .await
    .context("failed to re-point proposal sources")?;

    sqlx::query(
        "UPDATE merge_proposals SET target_person_id = ?, updated_at = ?
         WHERE status = 'pending' AND target_person_id = ?",
    )
    .bind(target)
    .bind(now_ts())
    .bind(source)
    .execute(&mut *tx)
    .await
    .context("failed to re-point proposal targets")?;

    sqlx::query(
        "UPDATE merge_proposals SET status = 'expired', updated_at = ?
         WHERE status = 'pending' AND source_person_id = target_person_id",
    )
    .bind(now_ts())
    .execute(&mut *tx)
    .await
    .context("failed to expire collapsed proposals")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::extract::{ingest_event, ParticipantSpec};
    use crate::store::events::NewEvent;
    use crate::{Channel, Direction, Role};

    async fn seed_two_persons(store: &Store) -> (String, String) {
        let a = ingest_event(
            store,
            &NewEvent {
                channel: Channel::Email,
                adapter: "gogcli".to_string(),
                external_id: "m-a".to_string(),
                timestamp: 1_700_000_000,
                content_types: vec![],
                content: Some("hi".to_string()),
                direction: Direction::Received,
                thread_id: None,
                reply_to: None,
                payload_hash: None,
            },
            &[ParticipantSpec::single(
                Channel::Email,
                "al@x.com",
                Some("Al".to_string()),
                Role::Sender,
            )],
        )
        .await
        .expect("ingest a");

        let b = ingest_event(
            store,
            &NewEvent {
                channel: Channel::Sms,
                adapter: "eve".to_string(),
                external_id: "m-b".to_string(),
                timestamp: 1_700_000_100,
                content_types: vec![],
                content: Some("yo".to_string()),
                direction: Direction::Received,
                thread_id: None,
                reply_to: None,
                payload_hash: None,
            },
            &[ParticipantSpec::single(
                Channel::Sms,
                "+15552223333",
                Some("Al Cooper".to_string()),
                Role::Sender,
            )],
        )
        .await
        .expect("ingest b");

        let a_person = store
            .participants_for_event(&a.event_id)
            .await
            .expect("participants")[0]
            .0
            .clone();
        let b_person = store
            .participants_for_event(&b.event_id)
            .await
            .expect("participants")[0]
            .0
            .clone();
        (a_person, b_person)
    }

    #[tokio::test]
    async fn merge_moves_everything_and_tombstones_source() {
        let store = Store::in_memory().await.expect("store should open");
        let (target, source) = seed_two_persons(&store).await;

        let merged = execute_merge(&store, &source, &target, ProposalType::HardCollision, 1.0)
            .await
            .expect("merge should succeed");
        assert!(merged);

        // Source is tombstoned and points at target.
        let tombstone = store
            .get_person(&source)
            .await
            .expect("get")
            .expect("person exists");
        assert_eq!(tombstone.merged_into.as_deref(), Some(target.as_str()));

        // No participant edge references the source any more.
        let stale: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM participants WHERE person_id = ?")
            .bind(&source)
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(stale, 0);

        // Identities from both channels now live on the target.
        let identities = store
            .identities_for_person(&target)
            .await
            .expect("identities");
        assert_eq!(identities.len(), 2);

        // Facts moved too (each identity minted a hard_identity fact).
        let stale_facts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts WHERE person_id = ?")
            .bind(&source)
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(stale_facts, 0);

        // The merge published a bus event.
        let events = store.list_bus_events(0, 10).await.expect("bus");
        assert!(events.iter().any(|e| e.event_type == crate::bus::IDENTITY_MERGED));

        // One active person remains.
        assert_eq!(store.list_active_persons().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn merging_same_root_twice_is_a_noop() {
        let store = Store::in_memory().await.expect("store should open");
        let (target, source) = seed_two_persons(&store).await;

        assert!(
            execute_merge(&store, &source, &target, ProposalType::SoftAccum, 0.7)
                .await
                .expect("merge")
        );
        assert!(
            !execute_merge(&store, &source, &target, ProposalType::SoftAccum, 0.7)
                .await
                .expect("re-merge resolves roots and no-ops")
        );
    }
}
