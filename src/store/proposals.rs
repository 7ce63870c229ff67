//! Merge proposals: human-reviewable suggestions produced by the resolver.

use crate::error::Result;
use crate::store::Store;
use crate::{new_id, now_ts};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqliteConnection};

/// What kind of evidence produced a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    HardCollision,
    Compound,
    SoftAccum,
    NameSimilarity,
    SharedDomain,
}

impl ProposalType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalType::HardCollision => "hard_collision",
            ProposalType::Compound => "compound",
            ProposalType::SoftAccum => "soft_accum",
            ProposalType::NameSimilarity => "name_similarity",
            ProposalType::SharedDomain => "shared_domain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hard_collision" => Some(ProposalType::HardCollision),
            "compound" => Some(ProposalType::Compound),
            "soft_accum" => Some(ProposalType::SoftAccum),
            "name_similarity" => Some(ProposalType::NameSimilarity),
            "shared_domain" => Some(ProposalType::SharedDomain),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProposalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proposal lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Executed,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ProposalStatus::Pending),
            "accepted" => Some(ProposalStatus::Accepted),
            "rejected" => Some(ProposalStatus::Rejected),
            "executed" => Some(ProposalStatus::Executed),
            "expired" => Some(ProposalStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A proposed merge of `source` into `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeProposal {
    pub id: String,
    pub source_person_id: String,
    pub target_person_id: String,
    pub proposal_type: ProposalType,
    pub score: f64,
    pub evidence: serde_json::Value,
    pub status: ProposalStatus,
    pub auto_eligible: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

fn proposal_from_row(row: sqlx::sqlite::SqliteRow) -> Result<MergeProposal> {
    let proposal_type: String = row
        .try_get("proposal_type")
        .context("failed to read proposal type")?;
    let status: String = row.try_get("status").context("failed to read status")?;
    let evidence: String = row.try_get("evidence").unwrap_or_else(|_| "[]".to_string());
    Ok(MergeProposal {
        id: row.try_get("id").context("failed to read proposal id")?,
        source_person_id: row
            .try_get("source_person_id")
            .context("failed to read source")?,
        target_person_id: row
            .try_get("target_person_id")
            .context("failed to read target")?,
        proposal_type: ProposalType::parse(&proposal_type)
            .with_context(|| format!("invalid proposal type in database: {proposal_type}"))?,
        score: row.try_get("score").unwrap_or(0.0),
        evidence: serde_json::from_str(&evidence).unwrap_or(serde_json::Value::Array(Vec::new())),
        status: ProposalStatus::parse(&status)
            .with_context(|| format!("invalid proposal status in database: {status}"))?,
        auto_eligible: row.try_get::<i64, _>("auto_eligible").unwrap_or(0) != 0,
        created_at: row.try_get("created_at").context("failed to read created_at")?,
        updated_at: row.try_get("updated_at").context("failed to read updated_at")?,
    })
}

/// Upsert a pending proposal for (source, target, type); a re-proposal
/// refreshes score and evidence when higher-scored.
pub async fn upsert_proposal(
    conn: &mut SqliteConnection,
    source: &str,
    target: &str,
    proposal_type: ProposalType,
    score: f64,
    evidence: &serde_json::Value,
    auto_eligible: bool,
) -> Result<()> {
    let now = now_ts();
    let existing: Option<(String, f64)> = sqlx::query_as(
        "SELECT id, score FROM merge_proposals
         WHERE source_person_id = ? AND target_person_id = ? AND proposal_type = ?
           AND status = 'pending'",
    )
    .bind(source)
    .bind(target)
    .bind(proposal_type.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("failed to look up pending proposal")?;

    match existing {
        Some((id, old_score)) if score > old_score => {
            sqlx::query(
                "UPDATE merge_proposals SET score = ?, evidence = ?, auto_eligible = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(score)
            .bind(evidence.to_string())
            .bind(auto_eligible as i64)
            .bind(now)
            .bind(&id)
            .execute(&mut *conn)
            .await
            .context("failed to refresh proposal")?;
        }
        Some(_) => {}
        None => {
            sqlx::query(
                "INSERT INTO merge_proposals
                     (id, source_person_id, target_person_id, proposal_type, score, evidence,
                      status, auto_eligible, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
            )
            .bind(new_id())
            .bind(source)
            .bind(target)
            .bind(proposal_type.as_str())
            .bind(score)
            .bind(evidence.to_string())
            .bind(auto_eligible as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("failed to insert proposal")?;
        }
    }
    Ok(())
}

/// Expire every other pending proposal touching either person of a settled
/// pair.
pub async fn expire_competing(
    conn: &mut SqliteConnection,
    settled_id: &str,
    source: &str,
    target: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE merge_proposals SET status = 'expired', updated_at = ?
         WHERE status = 'pending' AND id != ?
           AND (source_person_id IN (?, ?) OR target_person_id IN (?, ?))",
    )
    .bind(now_ts())
    .bind(settled_id)
    .bind(source)
    .bind(target)
    .bind(source)
    .bind(target)
    .execute(&mut *conn)
    .await
    .context("failed to expire competing proposals")?;
    Ok(result.rows_affected())
}

impl Store {
    pub async fn get_proposal(&self, id: &str) -> Result<Option<MergeProposal>> {
        let row = sqlx::query("SELECT * FROM merge_proposals WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("failed to fetch proposal")?;
        row.map(proposal_from_row).transpose()
    }

    pub async fn list_proposals(
        &self,
        status: Option<ProposalStatus>,
        limit: i64,
    ) -> Result<Vec<MergeProposal>> {
        let limit = limit.clamp(1, 1_000);
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM merge_proposals WHERE status = ?
                     ORDER BY score DESC, created_at LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query("SELECT * FROM merge_proposals ORDER BY score DESC, created_at LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await
            }
        }
        .context("failed to list proposals")?;
        rows.into_iter().map(proposal_from_row).collect()
    }

    pub async fn set_proposal_status(&self, id: &str, status: ProposalStatus) -> Result<()> {
        sqlx::query("UPDATE merge_proposals SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(self.pool())
            .await
            .context("failed to update proposal status")?;
        Ok(())
    }

    /// Whether a rejection between this unordered pair is recent enough to
    /// suppress new proposals.
    pub async fn recently_rejected(
        &self,
        person_a: &str,
        person_b: &str,
        within_secs: i64,
    ) -> Result<bool> {
        let cutoff = now_ts() - within_secs;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM merge_proposals
             WHERE status = 'rejected' AND updated_at >= ?
               AND ((source_person_id = ? AND target_person_id = ?)
                    OR (source_person_id = ? AND target_person_id = ?))",
        )
        .bind(cutoff)
        .bind(person_a)
        .bind(person_b)
        .bind(person_b)
        .bind(person_a)
        .fetch_one(self.pool())
        .await
        .context("failed to check rejection history")?;
        Ok(count > 0)
    }
}
