//! Identity resolution: collapse the identifier graph so every physical
//! person has exactly one active node, preserving evidence and lineage.

pub mod engine;
pub mod extract;
pub mod merge;
pub mod normalize;
pub mod unattributed;

use crate::error::{ResolveError, Result};
use crate::store::proposals::{MergeProposal, ProposalStatus};
use crate::store::Store;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub use engine::ResolverOptions;

/// Aggregate numbers for `identify stats` and the end-of-run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub active_persons: i64,
    pub tombstoned_persons: i64,
    pub total_facts: i64,
    pub hard_identifiers: i64,
    pub pending_proposals: i64,
    pub auto_eligible_proposals: i64,
    pub unresolved_facts: i64,
    pub cross_channel_persons: i64,
}

/// Outcome of one `resolve` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub facets_folded: usize,
    pub proposals_written: usize,
    pub auto_merges_executed: usize,
    pub facts_attributed: usize,
    pub stats: ResolutionStats,
}

/// The resolution engine facade.
#[derive(Debug, Clone)]
pub struct Resolver {
    store: Store,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            options: ResolverOptions::default(),
        }
    }

    pub fn with_options(store: Store, options: ResolverOptions) -> Self {
        Self { store, options }
    }

    /// Run the three resolver phases, writing pending proposals.
    pub async fn generate_suggestions(&self) -> Result<usize> {
        engine::run_phases(&self.store, &self.options).await
    }

    pub async fn list_suggestions(
        &self,
        status: Option<ProposalStatus>,
        limit: i64,
    ) -> Result<Vec<MergeProposal>> {
        self.store.list_proposals(status, limit).await
    }

    /// Accept a pending proposal and execute its merge.
    pub async fn accept(&self, proposal_id: &str) -> Result<()> {
        let proposal = self.pending_proposal(proposal_id).await?;

        merge::execute_proposal(&self.store, &proposal).await?;
        self.store
            .set_proposal_status(proposal_id, ProposalStatus::Executed)
            .await?;

        let mut tx = self.store.begin().await?;
        crate::store::proposals::expire_competing(
            &mut tx,
            proposal_id,
            &proposal.source_person_id,
            &proposal.target_person_id,
        )
        .await?;
        tx.commit().await.context("failed to expire competing proposals")?;

        unattributed::auto_attribute(&self.store).await?;
        Ok(())
    }

    /// Reject a pending proposal. The rejection suppresses re-proposal of the
    /// pair until the suppression window lapses.
    pub async fn reject(&self, proposal_id: &str) -> Result<()> {
        let _ = self.pending_proposal(proposal_id).await?;
        self.store
            .set_proposal_status(proposal_id, ProposalStatus::Rejected)
            .await
    }

    /// Execute every pending auto-eligible proposal, highest score first.
    /// Returns the number of merges performed.
    pub async fn execute_auto_merges(&self) -> Result<usize> {
        let pending = self
            .store
            .list_proposals(Some(ProposalStatus::Pending), 1_000)
            .await?;
        let mut executed = 0;

        for proposal in pending.into_iter().filter(|p| p.auto_eligible) {
            // A previous merge in this wave may have settled the pair.
            let current = self.store.get_proposal(&proposal.id).await?;
            let Some(current) = current else { continue };
            if current.status != ProposalStatus::Pending {
                continue;
            }

            let merged = merge::execute_proposal(&self.store, &current).await?;
            self.store
                .set_proposal_status(&current.id, ProposalStatus::Executed)
                .await?;

            let mut tx = self.store.begin().await?;
            crate::store::proposals::expire_competing(
                &mut tx,
                &current.id,
                &current.source_person_id,
                &current.target_person_id,
            )
            .await?;
            tx.commit().await.context("failed to expire competing proposals")?;

            if merged {
                executed += 1;
                tracing::info!(
                    source = %current.source_person_id,
                    target = %current.target_person_id,
                    score = current.score,
                    "auto merge executed"
                );
            }
        }

        if executed > 0 {
            unattributed::auto_attribute(&self.store).await?;
        }
        Ok(executed)
    }

    /// Full resolution pass: fold fresh analysis facets into facts, generate
    /// proposals, optionally execute the auto-eligible ones, then sweep the
    /// unattributed pool.
    pub async fn resolve(&self, auto: bool) -> Result<ResolutionReport> {
        let facets_folded = unattributed::fold_facets(&self.store).await?;
        let proposals_written = self.generate_suggestions().await?;
        let auto_merges_executed = if auto { self.execute_auto_merges().await? } else { 0 };
        let facts_attributed = unattributed::auto_attribute(&self.store).await?;
        let stats = self.resolution_stats().await?;
        Ok(ResolutionReport {
            facets_folded,
            proposals_written,
            auto_merges_executed,
            facts_attributed,
            stats,
        })
    }

    pub async fn resolution_stats(&self) -> Result<ResolutionStats> {
        let pool = self.store.pool();
        let active_persons: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE merged_into IS NULL")
                .fetch_one(pool)
                .await
                .context("failed to count active persons")?;
        let tombstoned_persons: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE merged_into IS NOT NULL")
                .fetch_one(pool)
                .await
                .context("failed to count tombstones")?;
        let total_facts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facts")
            .fetch_one(pool)
            .await
            .context("failed to count facts")?;
        let hard_identifiers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identities")
            .fetch_one(pool)
            .await
            .context("failed to count identities")?;
        let pending_proposals: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM merge_proposals WHERE status = 'pending'")
                .fetch_one(pool)
                .await
                .context("failed to count pending proposals")?;
        let auto_eligible_proposals: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM merge_proposals WHERE status = 'pending' AND auto_eligible = 1",
        )
        .fetch_one(pool)
        .await
        .context("failed to count auto proposals")?;
        let unresolved_facts: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM unattributed_facts WHERE resolved_person_id IS NULL",
        )
        .fetch_one(pool)
        .await
        .context("failed to count unresolved facts")?;
        let cross_channel_persons: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM (
                 SELECT person_id FROM identities
                 GROUP BY person_id HAVING COUNT(DISTINCT channel) > 1
             )",
        )
        .fetch_one(pool)
        .await
        .context("failed to count cross-channel persons")?;

        Ok(ResolutionStats {
            active_persons,
            tombstoned_persons,
            total_facts,
            hard_identifiers,
            pending_proposals,
            auto_eligible_proposals,
            unresolved_facts,
            cross_channel_persons,
        })
    }

    async fn pending_proposal(&self, proposal_id: &str) -> Result<MergeProposal> {
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| ResolveError::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.status != ProposalStatus::Pending {
            return Err(ResolveError::ProposalNotPending {
                id: proposal_id.to_string(),
                status: proposal.status.to_string(),
            }
            .into());
        }
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::facts::FactSource;
    use crate::Channel;

    #[tokio::test]
    async fn hard_collision_auto_merge_leaves_one_active_person() {
        let store = Store::in_memory().await.expect("store");
        let a = store
            .attach_person(Channel::Email, "a@x.com", Some("A"))
            .await
            .expect("attach a");
        let b = store
            .attach_person(Channel::Email, "b@y.com", Some("B"))
            .await
            .expect("attach b");
        for person in [&a.person_id, &b.person_id] {
            store
                .insert_fact(
                    person,
                    "contact",
                    "phone_number",
                    "+15552223333",
                    1.0,
                    FactSource::HardIdentity,
                    None,
                )
                .await
                .expect("fact");
        }

        let resolver = Resolver::new(store.clone());
        let report = resolver.resolve(true).await.expect("resolve");

        assert_eq!(report.auto_merges_executed, 1);
        assert_eq!(report.stats.active_persons, 1);
        assert_eq!(report.stats.tombstoned_persons, 1);

        // Re-running converges: nothing further to merge.
        let again = resolver.resolve(true).await.expect("resolve again");
        assert_eq!(again.auto_merges_executed, 0);
        assert_eq!(again.stats.active_persons, 1);
    }

    #[tokio::test]
    async fn accept_and_reject_gate_on_pending_status() {
        let store = Store::in_memory().await.expect("store");
        let resolver = Resolver::new(store.clone());

        let missing = resolver.accept("nope").await;
        assert!(missing.is_err());

        let a = store
            .attach_person(Channel::Email, "a@x.com", Some("A"))
            .await
            .expect("attach");
        let b = store
            .attach_person(Channel::Email, "b@y.com", Some("B"))
            .await
            .expect("attach");
        for person in [&a.person_id, &b.person_id] {
            store
                .insert_fact(
                    person,
                    "contact",
                    "slack_id",
                    "U0001",
                    1.0,
                    FactSource::HardIdentity,
                    None,
                )
                .await
                .expect("fact");
        }
        resolver.generate_suggestions().await.expect("generate");

        let pending = resolver
            .list_suggestions(Some(ProposalStatus::Pending), 10)
            .await
            .expect("list");
        let id = pending[0].id.clone();

        resolver.reject(&id).await.expect("reject");
        let rejected_again = resolver.reject(&id).await;
        assert!(rejected_again.is_err(), "double reject must fail");
    }
}
